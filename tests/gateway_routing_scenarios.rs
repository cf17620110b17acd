//! Behaviour tests for tool routing, failover and catalog consistency.

mod gateway_routing_steps;

use gateway_routing_steps::world::{GatewayWorld, world};
use rstest_bdd_macros::scenario;

#[scenario(
    path = "tests/features/gateway_routing.feature",
    name = "Round-robin spreads calls evenly"
)]
#[tokio::test(flavor = "multi_thread")]
async fn round_robin_spreads_calls(world: GatewayWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/gateway_routing.feature",
    name = "Degraded servers are skipped while active ones remain"
)]
#[tokio::test(flavor = "multi_thread")]
async fn degraded_servers_are_skipped(world: GatewayWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/gateway_routing.feature",
    name = "Failover hides a failing provider"
)]
#[tokio::test(flavor = "multi_thread")]
async fn failover_hides_failures(world: GatewayWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/gateway_routing.feature",
    name = "Deregistering the only provider makes the tool unknown"
)]
#[tokio::test(flavor = "multi_thread")]
async fn deregistration_removes_tool(world: GatewayWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/gateway_routing.feature",
    name = "Duplicate active registration is rejected"
)]
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_registration_conflicts(world: GatewayWorld) {
    let _ = world;
}
