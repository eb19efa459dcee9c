use rand::rngs::StdRng;
use rand::Rng;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

use crate::auth::AuthError;
use crate::client::{GatewayClient, ServiceResponse};
use crate::dispatch::ActionTable;
use crate::flow::{ChainedFlow, FlowContext, FlowExecutor, FlowResult, FlowStep, StepOutcome};
use crate::metrics::{Check, Metrics, Threshold};
use crate::scheduler::{self, ExecutorProfile, RunState, Stage, ThinkTime};
use crate::types::{
    ConfigError, OrderDetails, OrderPayload, PaymentDetails, PaymentPayload, ProductDetails,
    ProductPayload, Service,
};

pub mod names {
    pub const TOTAL_OPERATIONS: &str = "total_operations";
    pub const ORDERS_PLACED: &str = "orders_placed";
    pub const ECOSYSTEM_ERRORS: &str = "ecosystem_errors";
    pub const SERVICE_AVAILABILITY: &str = "service_availability";
    pub const BUSINESS_SUCCESS: &str = "business_success";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const ECOSYSTEM_RESPONSE_TIME: &str = "ecosystem_response_time";
    pub const ORDER_SERVICE_RESPONSE: &str = "order_service_response";
    pub const PAYMENT_SERVICE_RESPONSE: &str = "payment_service_response";
    pub const PRODUCT_SERVICE_RESPONSE: &str = "product_service_response";
}

const PLACE_ORDER_STEP: &str = "place_order";

/// Every metric the scenarios record, registered up front so the hot path
/// never mutates the registry.
pub fn registry() -> Metrics {
    Metrics::new(
        &[
            names::TOTAL_OPERATIONS,
            names::ORDERS_PLACED,
            scheduler::DROPPED_ITERATIONS,
        ],
        &[
            names::ECOSYSTEM_ERRORS,
            names::SERVICE_AVAILABILITY,
            names::BUSINESS_SUCCESS,
        ],
        &[
            names::HTTP_REQ_DURATION,
            names::ECOSYSTEM_RESPONSE_TIME,
            names::ORDER_SERVICE_RESPONSE,
            names::PAYMENT_SERVICE_RESPONSE,
            names::PRODUCT_SERVICE_RESPONSE,
        ],
    )
}

pub fn default_thresholds() -> Vec<Threshold> {
    vec![
        Threshold {
            metric: names::HTTP_REQ_DURATION,
            check: Check::PercentileBelow {
                pct: 95.0,
                limit_ms: 3000.0,
            },
        },
        Threshold {
            metric: names::ECOSYSTEM_ERRORS,
            check: Check::RateBelow(0.1),
        },
        Threshold {
            metric: names::SERVICE_AVAILABILITY,
            check: Check::RateAbove(0.95),
        },
        Threshold {
            metric: names::ECOSYSTEM_RESPONSE_TIME,
            check: Check::PercentileBelow {
                pct: 90.0,
                limit_ms: 2500.0,
            },
        },
    ]
}

pub fn service_trend(service: Service) -> Option<&'static str> {
    match service {
        Service::Orders => Some(names::ORDER_SERVICE_RESPONSE),
        Service::Payments => Some(names::PAYMENT_SERVICE_RESPONSE),
        Service::Products => Some(names::PRODUCT_SERVICE_RESPONSE),
        Service::Gateway => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioKind {
    BusinessFlow,
    ServiceStress,
    HealthCheck,
    Mixed,
}

/// Single-call actions for the service-stress mix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StressAction {
    PlaceOrder,
    FetchOrder,
    CreatePayment,
    FetchPayment,
    FetchProduct,
    ReduceInventory,
    CreateProduct,
}

/// Per-service action mix: services equally likely, then place/fetch 60/40
/// for orders, create/fetch 70/30 for payments, fetch/reduce/create 50/30/20
/// for products.
pub fn stress_action_table() -> Result<ActionTable<StressAction>, ConfigError> {
    const THIRD: f64 = 1.0 / 3.0;
    ActionTable::new(&[
        (StressAction::PlaceOrder, 0.6 * THIRD),
        (StressAction::FetchOrder, 0.4 * THIRD),
        (StressAction::CreatePayment, 0.7 * THIRD),
        (StressAction::FetchPayment, 0.3 * THIRD),
        (StressAction::FetchProduct, 0.5 * THIRD),
        (StressAction::ReduceInventory, 0.3 * THIRD),
        (StressAction::CreateProduct, 0.2 * THIRD),
    ])
}

pub struct Scenario {
    pub name: &'static str,
    pub kind: ScenarioKind,
    pub think_time: ThinkTime,
    stress_actions: ActionTable<StressAction>,
}

impl Scenario {
    pub fn new(kind: ScenarioKind) -> Result<Self, ConfigError> {
        let (name, think_time) = match kind {
            ScenarioKind::BusinessFlow => ("business-flow", ThinkTime::from_secs_f64(1.0, 3.0)),
            ScenarioKind::ServiceStress => ("service-stress", ThinkTime::from_secs_f64(0.5, 1.5)),
            ScenarioKind::HealthCheck => ("health-check", ThinkTime::NONE),
            ScenarioKind::Mixed => ("mixed", ThinkTime::from_secs_f64(1.0, 3.0)),
        };
        Ok(Self {
            name,
            kind,
            think_time,
            stress_actions: stress_action_table()?,
        })
    }

    /// Executor profile for this scenario, stage durations multiplied by
    /// `time_scale` so a full 14-minute schedule can be rehearsed in seconds.
    pub fn profile(&self, time_scale: f64) -> ExecutorProfile {
        let scaled = |secs: u64| scale_duration(Duration::from_secs(secs), time_scale);
        match self.kind {
            ScenarioKind::BusinessFlow | ScenarioKind::Mixed => ExecutorProfile::Ramping {
                start: 0,
                stages: vec![
                    Stage {
                        duration: scaled(120),
                        target: 20,
                    },
                    Stage {
                        duration: scaled(300),
                        target: 40,
                    },
                    Stage {
                        duration: scaled(120),
                        target: 80,
                    },
                    Stage {
                        duration: scaled(180),
                        target: 40,
                    },
                    Stage {
                        duration: scaled(120),
                        target: 0,
                    },
                ],
            },
            ScenarioKind::ServiceStress => ExecutorProfile::ConstantVus {
                vus: 25,
                duration: scaled(480),
            },
            ScenarioKind::HealthCheck => ExecutorProfile::ConstantArrivalRate {
                rate_per_sec: 5,
                duration: scaled(840),
                pool: 5,
            },
        }
    }

    pub async fn run_iteration(
        &self,
        client: &GatewayClient,
        metrics: &Metrics,
        run: &RunState,
        rng: &mut StdRng,
    ) -> Result<(), AuthError> {
        match self.kind {
            ScenarioKind::BusinessFlow => self.run_business(client, metrics, run, rng).await,
            ScenarioKind::ServiceStress => self.run_stress(client, metrics, run, rng).await,
            ScenarioKind::HealthCheck => self.run_health(client, metrics, run).await,
            ScenarioKind::Mixed => {
                if rng.gen_bool(0.5) {
                    self.run_business(client, metrics, run, rng).await
                } else {
                    self.run_stress(client, metrics, run, rng).await
                }
            }
        }
    }

    async fn run_business(
        &self,
        client: &GatewayClient,
        metrics: &Metrics,
        run: &RunState,
        rng: &mut StdRng,
    ) -> Result<(), AuthError> {
        let flow = business_flow(rng);
        let result = FlowExecutor { client, run }.run(&flow).await?;
        record_flow(metrics, &result, true);
        Ok(())
    }

    async fn run_stress(
        &self,
        client: &GatewayClient,
        metrics: &Metrics,
        run: &RunState,
        rng: &mut StdRng,
    ) -> Result<(), AuthError> {
        let action = self.stress_actions.select(rng.gen());
        let flow = stress_flow(action, rng);
        let result = FlowExecutor { client, run }.run(&flow).await?;
        record_flow(metrics, &result, true);
        Ok(())
    }

    async fn run_health(
        &self,
        client: &GatewayClient,
        metrics: &Metrics,
        run: &RunState,
    ) -> Result<(), AuthError> {
        for flow in health_flows() {
            if run.is_aborted() {
                break;
            }
            let result = FlowExecutor { client, run }.run(&flow).await?;
            record_flow(metrics, &result, false);
        }
        Ok(())
    }
}

/// The full cross-service transaction: look up a product, place an order,
/// then fetch the created order's nested detail.
pub fn business_flow(rng: &mut impl Rng) -> ChainedFlow {
    let product_id = rng.gen_range(1..=5);
    let order = OrderPayload::random(rng);
    ChainedFlow {
        name: "business_flow",
        steps: vec![
            FlowStep {
                name: "product_lookup",
                service: Service::Products,
                method: Method::GET,
                path: format!("products/{}", product_id),
                body: None,
                check: check_product_lookup,
                extract: None,
            },
            FlowStep {
                name: PLACE_ORDER_STEP,
                service: Service::Orders,
                method: Method::POST,
                path: "orders/placeOrder".to_string(),
                body: Some(to_body(&order)),
                check: check_place_order,
                extract: Some(extract_order_id),
            },
            FlowStep {
                name: "order_details",
                service: Service::Orders,
                method: Method::GET,
                path: "orders/{order_id}".to_string(),
                body: None,
                check: check_order_details,
                extract: None,
            },
        ],
    }
}

pub fn stress_flow(action: StressAction, rng: &mut impl Rng) -> ChainedFlow {
    let step = match action {
        StressAction::PlaceOrder => FlowStep {
            name: PLACE_ORDER_STEP,
            service: Service::Orders,
            method: Method::POST,
            path: "orders/placeOrder".to_string(),
            body: Some(to_body(&OrderPayload::random(rng))),
            check: check_place_order,
            extract: None,
        },
        StressAction::FetchOrder => FlowStep {
            name: "fetch_order",
            service: Service::Orders,
            method: Method::GET,
            path: format!("orders/{}", rng.gen_range(1..=20)),
            body: None,
            check: check_order_probe,
            extract: None,
        },
        StressAction::CreatePayment => FlowStep {
            name: "create_payment",
            service: Service::Payments,
            method: Method::POST,
            path: "payments".to_string(),
            body: Some(to_body(&PaymentPayload::random(rng))),
            check: check_payment_created,
            extract: None,
        },
        StressAction::FetchPayment => FlowStep {
            name: "fetch_payment",
            service: Service::Payments,
            method: Method::GET,
            path: format!("payments/order/{}", rng.gen_range(1..=50)),
            body: None,
            check: check_payment_probe,
            extract: None,
        },
        StressAction::FetchProduct => FlowStep {
            name: "fetch_product",
            service: Service::Products,
            method: Method::GET,
            path: format!("products/{}", rng.gen_range(1..=10)),
            body: None,
            check: check_product_lookup,
            extract: None,
        },
        StressAction::ReduceInventory => FlowStep {
            name: "reduce_inventory",
            service: Service::Products,
            method: Method::PUT,
            path: format!(
                "products/reduceQuantity/{}?quantity={}",
                rng.gen_range(1..=5),
                rng.gen_range(1..=3)
            ),
            body: None,
            check: check_reduce_inventory,
            extract: None,
        },
        StressAction::CreateProduct => FlowStep {
            name: "create_product",
            service: Service::Products,
            method: Method::POST,
            path: "products".to_string(),
            body: Some(to_body(&ProductPayload::random(rng))),
            check: check_product_created,
            extract: None,
        },
    };
    ChainedFlow {
        name: "service_stress",
        steps: vec![step],
    }
}

/// One availability probe per service plus the gateway itself, each an
/// independent single-step flow so one unhealthy service does not mask the
/// others.
pub fn health_flows() -> Vec<ChainedFlow> {
    [
        (Service::Gateway, "health"),
        (Service::Orders, "orders/health"),
        (Service::Payments, "payments/health"),
        (Service::Products, "products/health"),
    ]
    .into_iter()
    .map(|(service, path)| ChainedFlow {
        name: "health_check",
        steps: vec![FlowStep {
            name: "health",
            service,
            method: Method::GET,
            path: path.to_string(),
            body: None,
            check: check_healthy,
            extract: None,
        }],
    })
    .collect()
}

fn record_flow(metrics: &Metrics, result: &FlowResult, business: bool) {
    for record in &result.steps {
        metrics.add_count(names::TOTAL_OPERATIONS, 1);
        let ms = record.duration.as_millis() as u64;
        metrics.record_ms(names::HTTP_REQ_DURATION, ms);
        metrics.record_ms(names::ECOSYSTEM_RESPONSE_TIME, ms);
        if let Some(trend) = service_trend(record.service) {
            metrics.record_ms(trend, ms);
        }
        let failed = record.outcome.is_hard_error();
        metrics.observe(names::SERVICE_AVAILABILITY, !failed);
        metrics.observe(names::ECOSYSTEM_ERRORS, failed);
        if record.name == PLACE_ORDER_STEP && record.outcome == StepOutcome::Passed {
            metrics.add_count(names::ORDERS_PLACED, 1);
        }
    }
    if business {
        if result.succeeded() {
            metrics.observe(names::BUSINESS_SUCCESS, true);
        } else if result.had_hard_error() {
            metrics.observe(names::BUSINESS_SUCCESS, false);
        }
        // expected misses stay out of the business-success rate entirely
    }
}

fn check_product_lookup(response: &ServiceResponse) -> StepOutcome {
    if response.status == 404 {
        return StepOutcome::ExpectedMiss;
    }
    if !response.is_success() {
        return StepOutcome::Failed(format!("unexpected status {}", response.status));
    }
    match response.json::<ProductDetails>() {
        Ok(product) if product.is_complete() => StepOutcome::Passed,
        Ok(_) => StepOutcome::Failed("incomplete product detail".to_string()),
        Err(_) => StepOutcome::Failed("malformed product body".to_string()),
    }
}

fn check_place_order(response: &ServiceResponse) -> StepOutcome {
    if response.status != 200 {
        return StepOutcome::Failed(format!("unexpected status {}", response.status));
    }
    match response.body.trim().parse::<u64>() {
        Ok(_) => StepOutcome::Passed,
        Err(_) => StepOutcome::Failed("order id was not numeric".to_string()),
    }
}

fn check_order_details(response: &ServiceResponse) -> StepOutcome {
    // the order was created one step earlier, so not-found here is a real fault
    if !response.is_success() {
        return StepOutcome::Failed(format!("unexpected status {}", response.status));
    }
    match response.json::<OrderDetails>() {
        Ok(details) if details.is_complete() => StepOutcome::Passed,
        Ok(_) => StepOutcome::Failed("incomplete order detail".to_string()),
        Err(_) => StepOutcome::Failed("malformed order body".to_string()),
    }
}

fn check_order_probe(response: &ServiceResponse) -> StepOutcome {
    if response.status == 404 {
        return StepOutcome::ExpectedMiss;
    }
    check_order_details(response)
}

fn check_payment_created(response: &ServiceResponse) -> StepOutcome {
    if response.status != 201 {
        return StepOutcome::Failed(format!("unexpected status {}", response.status));
    }
    match response.body.trim().parse::<u64>() {
        Ok(_) => StepOutcome::Passed,
        Err(_) => StepOutcome::Failed("payment id was not numeric".to_string()),
    }
}

fn check_payment_probe(response: &ServiceResponse) -> StepOutcome {
    if response.status == 404 {
        return StepOutcome::ExpectedMiss;
    }
    if !response.is_success() {
        return StepOutcome::Failed(format!("unexpected status {}", response.status));
    }
    match response.json::<PaymentDetails>() {
        Ok(payment) if payment.is_complete() => StepOutcome::Passed,
        Ok(_) => StepOutcome::Failed("incomplete payment detail".to_string()),
        Err(_) => StepOutcome::Failed("malformed payment body".to_string()),
    }
}

fn check_reduce_inventory(response: &ServiceResponse) -> StepOutcome {
    if response.status == 200 {
        StepOutcome::Passed
    } else {
        StepOutcome::Failed(format!("unexpected status {}", response.status))
    }
}

fn check_product_created(response: &ServiceResponse) -> StepOutcome {
    if response.status != 201 {
        return StepOutcome::Failed(format!("unexpected status {}", response.status));
    }
    match response.body.trim().parse::<u64>() {
        Ok(_) => StepOutcome::Passed,
        Err(_) => StepOutcome::Failed("product id was not numeric".to_string()),
    }
}

fn check_healthy(response: &ServiceResponse) -> StepOutcome {
    if response.status == 200 {
        StepOutcome::Passed
    } else {
        StepOutcome::Failed(format!("unexpected status {}", response.status))
    }
}

fn extract_order_id(response: &ServiceResponse, context: &mut FlowContext) -> Result<(), String> {
    let order_id = response
        .body
        .trim()
        .parse::<u64>()
        .map_err(|_| "order id was not numeric".to_string())?;
    context.insert("order_id", order_id.to_string());
    Ok(())
}

fn to_body<T: serde::Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).expect("payload serializes")
}

fn scale_duration(duration: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64((duration.as_secs_f64() * factor).max(0.001))
}
