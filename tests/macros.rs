#![cfg(feature = "macros")]

mod common;

use std::time::Duration;

use common::{MockConnector, scenario};
use stampede::{
    ActionResult, Request, RunConfig, RunController, TaskSetSpec, TaskSpec, UserContext,
    UserProfile, macros::action,
};

#[action]
async fn login(ctx: &mut UserContext) -> ActionResult {
    ctx.request("POST /api/authenticate", Request::post("/api/authenticate"))
        .await?;
    ctx.insert("jwt", format!("token-{}", ctx.user_id()));
    Ok(())
}

#[action]
async fn list_orders(ctx: &mut UserContext) -> ActionResult {
    let jwt = ctx.get::<String>("jwt").cloned().unwrap_or_default();
    let req = Request::get("/api/orders").with_header("Authorization", format!("Bearer {jwt}"));
    ctx.request("GET /api/orders", req).await?;
    Ok(())
}

#[action]
async fn logout(ctx: &mut UserContext) -> ActionResult {
    ctx.request("POST /api/logout", Request::post("/api/logout"))
        .await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn attribute_actions_plug_into_tasks_and_hooks() {
    let connector = MockConnector::ok();
    let profile = UserProfile::new(
        "account",
        TaskSetSpec::sequential().task(TaskSpec::new("GET /api/orders", list_orders)),
    )
    .with_wait(stampede::WaitPolicy::constant(1.0).unwrap())
    .on_start(login)
    .on_stop(logout);

    let mut controller = RunController::new(scenario(&connector, vec![profile]));
    let config = RunConfig::builder()
        .users(3)
        .spawn_rate(f64::INFINITY)
        .workers(1)
        .build();
    controller.start(&config).unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    controller.stop(Duration::from_secs(2)).await.unwrap();

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.label("POST /api/authenticate").unwrap().count, 3);
    assert_eq!(snapshot.label("GET /api/orders").unwrap().count, 9);
    assert_eq!(snapshot.label("POST /api/logout").unwrap().count, 3);
}
