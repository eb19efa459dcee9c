use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity-provider and gateway token endpoints plus the client-credentials
/// payload fields sent to both.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
    pub scope: String,
    pub token_url: String,
    pub provider_token_url: String,
}

impl AuthSettings {
    pub fn from_env(gateway_url: &str) -> Self {
        let domain = std::env::var("AUTH0_DOMAIN")
            .unwrap_or_else(|_| "YOUR_AUTH0_DOMAIN.auth0.com".to_string());
        Self {
            client_id: std::env::var("AUTH0_CLIENT_ID")
                .unwrap_or_else(|_| "YOUR_CLIENT_ID".to_string()),
            client_secret: std::env::var("AUTH0_CLIENT_SECRET")
                .unwrap_or_else(|_| "YOUR_CLIENT_SECRET".to_string()),
            audience: std::env::var("AUTH0_AUDIENCE")
                .unwrap_or_else(|_| format!("https://{}/api/v2/", domain)),
            scope: std::env::var("AUTH0_SCOPE").unwrap_or_else(|_| "read:users".to_string()),
            token_url: format!(
                "{}/token/client-credentials",
                gateway_url.trim_end_matches('/')
            ),
            provider_token_url: format!("https://{}/oauth/token", domain),
        }
    }
}

pub fn gateway_url_from_env() -> String {
    std::env::var("GATEWAY_URL").unwrap_or_else(|_| "http://localhost:9090".to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    Gateway,
    Orders,
    Payments,
    Products,
}

impl Service {
    pub fn name(self) -> &'static str {
        match self {
            Service::Gateway => "gateway",
            Service::Orders => "orders",
            Service::Payments => "payments",
            Service::Products => "products",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("action weight table is empty")]
    EmptyTable,
    #[error("action weight for {0} must be non-negative, got {1}")]
    NegativeWeight(String, f64),
    #[error("action weights sum to {0}, expected 1.0")]
    NonExhaustiveTable(f64),
    #[error("executor profile has no stages")]
    EmptySchedule,
    #[error("stage {0} has zero duration")]
    ZeroDurationStage(usize),
    #[error("arrival rate and worker pool must both be non-zero")]
    InvalidArrivalRate,
    #[error("threshold references unknown {kind} metric {metric}")]
    UnknownMetric { kind: &'static str, metric: String },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMode {
    Cash,
    CreditCard,
    DebitCard,
}

impl PaymentMode {
    pub fn random(rng: &mut impl Rng) -> Self {
        match rng.gen_range(0..3) {
            0 => PaymentMode::Cash,
            1 => PaymentMode::CreditCard,
            _ => PaymentMode::DebitCard,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderPayload {
    #[serde(rename = "productId")]
    pub product_id: u64,
    pub quantity: u32,
    #[serde(rename = "totalAmount")]
    pub total_amount: f64,
    #[serde(rename = "paymentMode")]
    pub payment_mode: PaymentMode,
}

impl OrderPayload {
    pub fn random(rng: &mut impl Rng) -> Self {
        Self {
            product_id: rng.gen_range(1..=5),
            quantity: rng.gen_range(1..=3),
            total_amount: round_cents(rng.gen_range(100.0..600.0)),
            payment_mode: PaymentMode::random(rng),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentPayload {
    #[serde(rename = "orderId")]
    pub order_id: u64,
    pub amount: f64,
    #[serde(rename = "paymentMode")]
    pub payment_mode: PaymentMode,
}

impl PaymentPayload {
    pub fn random(rng: &mut impl Rng) -> Self {
        Self {
            order_id: rng.gen_range(1..=100),
            amount: round_cents(rng.gen_range(50.0..550.0)),
            payment_mode: PaymentMode::random(rng),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProductPayload {
    pub name: String,
    pub price: f64,
    pub quantity: u32,
}

impl ProductPayload {
    pub fn random(rng: &mut impl Rng) -> Self {
        Self {
            name: format!("Test Product {}", rng.gen_range(0..1000)),
            price: round_cents(rng.gen_range(10.0..210.0)),
            quantity: rng.gen_range(10..=110),
        }
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Order detail as returned by the order service, with the nested product and
/// payment blocks the detail chain is expected to resolve.
#[derive(Debug, Deserialize)]
pub struct OrderDetails {
    #[serde(rename = "orderId")]
    pub order_id: Option<u64>,
    #[serde(rename = "productDetails")]
    pub product_details: Option<Value>,
    #[serde(rename = "paymentDetails")]
    pub payment_details: Option<Value>,
}

impl OrderDetails {
    pub fn is_complete(&self) -> bool {
        self.order_id.is_some() && self.product_details.is_some() && self.payment_details.is_some()
    }
}

#[derive(Debug, Deserialize)]
pub struct PaymentDetails {
    #[serde(rename = "paymentId")]
    pub payment_id: Option<i64>,
    pub amount: Option<f64>,
    #[serde(rename = "paymentMode")]
    pub payment_mode: Option<String>,
}

impl PaymentDetails {
    pub fn is_complete(&self) -> bool {
        self.payment_id.is_some() && self.amount.is_some() && self.payment_mode.is_some()
    }
}

#[derive(Debug, Deserialize)]
pub struct ProductDetails {
    #[serde(rename = "productId")]
    pub product_id: Option<i64>,
    #[serde(rename = "productName")]
    pub product_name: Option<String>,
    pub price: Option<f64>,
}

impl ProductDetails {
    pub fn is_complete(&self) -> bool {
        self.product_id.is_some() && self.product_name.is_some() && self.price.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn order_payload_serializes_with_gateway_field_names() {
        let mut rng = StdRng::seed_from_u64(7);
        let value = serde_json::to_value(OrderPayload::random(&mut rng)).unwrap();
        assert!(value.get("productId").is_some());
        assert!(value.get("totalAmount").is_some());
        let mode = value.get("paymentMode").unwrap().as_str().unwrap();
        assert!(matches!(mode, "CASH" | "CREDIT_CARD" | "DEBIT_CARD"));
    }

    #[test]
    fn random_order_stays_in_catalog_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let order = OrderPayload::random(&mut rng);
            assert!((1..=5).contains(&order.product_id));
            assert!((1..=3).contains(&order.quantity));
            assert!(order.total_amount >= 100.0 && order.total_amount < 600.0);
        }
    }
}
