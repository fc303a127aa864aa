use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use rand::{Rng, distr::Alphanumeric};
use serde_json::json;
use stampede::{
    ActionError, ActionResult, Reporter, Request, RunConfig, RunController, Scenario,
    StdoutReporter, TaskSetSpec, TaskSpec, UserContext, UserProfile, WaitPolicy,
    client::ReqwestConnector, macros::action,
};
use tracing_subscriber::EnvFilter;

/// Prefix for every API path, e.g. `/gateway`, from `STAMPEDE_BASE_PATH`.
static BASE_PATH: LazyLock<String> = LazyLock::new(|| {
    std::env::var("STAMPEDE_BASE_PATH")
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_owned()
});
static USERNAME: LazyLock<String> = LazyLock::new(|| env_or("STAMPEDE_USERNAME", "test"));
static PASSWORD: LazyLock<String> = LazyLock::new(|| env_or("STAMPEDE_PASSWORD", "password"));

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn api(path: &str) -> String {
    format!("{}{path}", *BASE_PATH)
}

fn rand_username(ctx: &mut UserContext, prefix: &str) -> String {
    let suffix: String = ctx
        .rng()
        .sample_iter(Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{prefix}_{suffix}")
}

fn bearer(ctx: &UserContext, request: Request) -> Request {
    match ctx.get::<String>("jwt") {
        Some(jwt) => request.with_header("Authorization", format!("Bearer {jwt}")),
        None => request,
    }
}

#[action]
async fn authenticate(ctx: &mut UserContext) -> ActionResult {
    let req = Request::post(api("/api/authenticate"))
        .with_json(&json!({ "username": USERNAME.as_str(), "password": PASSWORD.as_str() }))?;
    let res = ctx
        .request_checked("POST /api/authenticate", req, |res| {
            let has_token = res
                .json::<serde_json::Value>()
                .is_ok_and(|body| body["jwtToken"].is_string());
            if res.status == 200 && has_token {
                Ok(())
            } else {
                Err(format!("Auth failed: {} {}", res.status, res.text()))
            }
        })
        .await?;

    let body: serde_json::Value = res.json()?;
    match body["jwtToken"].as_str() {
        Some(jwt) if res.status == 200 => {
            ctx.insert("jwt", jwt.to_owned());
            Ok(())
        }
        _ => Err(ActionError::FatalStart(format!(
            "no token for {} (HTTP {})",
            USERNAME.as_str(),
            res.status
        ))),
    }
}

#[action]
async fn list_products(ctx: &mut UserContext) -> ActionResult {
    ctx.request("GET /api/products", Request::get(api("/api/products")))
        .await?;
    Ok(())
}

#[action]
async fn create_order(ctx: &mut UserContext) -> ActionResult {
    let fee = (ctx.rng().random_range(10.0..200.0) * 100.0_f64).round() / 100.0;
    let req = Request::post(api("/api/orders")).with_json(&json!({
        "orderDesc": "Load order",
        "orderFee": fee,
        "cart": { "userId": 1 },
    }))?;
    let req = bearer(ctx, req);
    ctx.request("POST /api/orders", req).await?;
    Ok(())
}

#[action]
async fn create_order_and_pay(ctx: &mut UserContext) -> ActionResult {
    let fee = (ctx.rng().random_range(5.0..150.0) * 100.0_f64).round() / 100.0;
    let req = Request::post(api("/api/orders")).with_json(&json!({
        "orderDesc": "Order+Pay",
        "orderFee": fee,
        "cart": { "userId": 1 },
    }))?;
    let req = bearer(ctx, req);
    let res = ctx
        .request_checked("POST /api/orders (for payment)", req, |res| {
            if res.status == 200 {
                Ok(())
            } else {
                Err(format!("Order failed: {}", res.status))
            }
        })
        .await?;
    if res.status != 200 {
        return Err(ActionError::Assertion(format!("order status {}", res.status)));
    }

    let created: serde_json::Value = res.json()?;
    let req = Request::post(api("/api/payments")).with_json(&json!({
        "order": {
            "orderId": created["orderId"],
            "orderDesc": created["orderDesc"],
            "orderFee": created["orderFee"],
            "orderDate": created["orderDate"],
        }
    }))?;
    let req = bearer(ctx, req);
    ctx.request("POST /api/payments", req).await?;
    Ok(())
}

#[action]
async fn favourites_add_and_list(ctx: &mut UserContext) -> ActionResult {
    let req = Request::post(api("/api/favourites")).with_json(&json!({
        "userId": 1,
        "productId": 1,
        "likeDate": "01-01-2025__12:00:00:000000",
    }))?;
    let req = bearer(ctx, req);
    ctx.request("POST /api/favourites", req).await?;

    let req = bearer(ctx, Request::get(api("/api/favourites")));
    ctx.request("GET /api/favourites", req).await?;
    Ok(())
}

#[action]
async fn signup_then_login(ctx: &mut UserContext) -> ActionResult {
    let username = rand_username(ctx, "stampede");
    let req = Request::post(api("/api/users")).with_json(&json!({
        "firstName": "Load",
        "lastName": "Tester",
        "email": format!("{username}@example.com"),
        "phone": "3000000000",
        "credential": {
            "username": username,
            "password": "pwd",
            "roleBasedAuthority": "ROLE_USER",
        },
    }))?;
    let req = bearer(ctx, req);
    ctx.request("POST /api/users", req).await?;

    let req = Request::post(api("/api/authenticate"))
        .with_json(&json!({ "username": username, "password": "pwd" }))?;
    ctx.request("POST /api/authenticate (new user)", req).await?;
    Ok(())
}

#[action]
async fn product_by_id(ctx: &mut UserContext) -> ActionResult {
    let id = ctx.rng().random_range(1..=4);
    ctx.request(
        "GET /api/products/{productId}",
        Request::get(api(&format!("/api/products/{id}"))),
    )
    .await?;
    Ok(())
}

#[action]
async fn list_categories(ctx: &mut UserContext) -> ActionResult {
    ctx.request("GET /api/categories", Request::get(api("/api/categories")))
        .await?;
    Ok(())
}

fn shopper() -> UserProfile {
    // one pass: products x3, order x2, order plus payment x2, favourites, signup
    let flows = TaskSetSpec::sequential()
        .task(TaskSpec::new("list_products", list_products).with_weight(3))
        .task(TaskSpec::new("create_order", create_order).with_weight(2))
        .task(TaskSpec::new("create_order_and_pay", create_order_and_pay).with_weight(2))
        .task(TaskSpec::new("favourites", favourites_add_and_list).with_weight(1))
        .task(TaskSpec::new("signup_then_login", signup_then_login).with_weight(1));

    UserProfile::new("shopper", flows)
        .with_weight(3)
        .with_wait(WaitPolicy::from_env(WaitPolicy::between(0.2, 1.0).unwrap()).unwrap())
        .on_start(authenticate)
}

fn catalog_browser() -> UserProfile {
    let browse = TaskSetSpec::weighted()
        .task(TaskSpec::new("list_products", list_products).with_weight(10))
        .task(TaskSpec::new("product_by_id", product_by_id).with_weight(5))
        .task(TaskSpec::new("list_categories", list_categories).with_weight(5));

    UserProfile::new("catalog_browser", browse).with_wait(WaitPolicy::between(1.0, 3.0).unwrap())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = if std::env::var("STAMPEDE_USERS").is_ok() {
        RunConfig::from_env().unwrap()
    } else {
        RunConfig::builder()
            .users(20)
            .spawn_rate(5.0)
            .run_time(Duration::from_secs(30))
            .report_interval(Duration::from_secs(5))
            .build()
    };

    let scenario = Scenario::builder()
        .name("E-commerce flows")
        .host("http://localhost:8080")
        .profiles(vec![shopper(), catalog_browser()])
        .connector(Arc::new(
            ReqwestConnector::builder()
                .default_timeout(Duration::from_secs(10))
                .build(),
        ))
        .build()
        .with_env_host();

    let mut controller = RunController::new(scenario);
    let snapshot = controller.run(&config).await.unwrap();
    StdoutReporter.report(&snapshot).await.unwrap();
}
