//! When steps for gateway routing BDD scenarios.

use super::world::{GatewayWorld, build_descriptor, run_async};
use rstest_bdd_macros::when;
use serde_json::json;
use std::time::Duration;
use toolmesh::gateway::domain::{ServerId, ToolName};

#[when(r#"{count:usize} calls to "{tool}" are made"#)]
fn calls_are_made(world: &mut GatewayWorld, count: usize, tool: String) -> Result<(), eyre::Report> {
    let name = ToolName::new(tool)?;
    world.servers.reset_calls();
    world.call_results.clear();
    for _ in 0..count {
        let result = run_async(world.gateway.invoke_within(
            &name,
            json!({}),
            Duration::from_secs(2),
        ))
        .map(|response| response.server_id);
        world.call_results.push(result);
    }
    Ok(())
}

#[when(r#"server "{id}" is deregistered"#)]
fn server_is_deregistered(world: &mut GatewayWorld, id: String) -> Result<(), eyre::Report> {
    let server_id = ServerId::new(id)?;
    if !world.gateway.deregister_server(&server_id) {
        return Err(eyre::eyre!("server {server_id} was not registered"));
    }
    Ok(())
}

#[when(r#"server "{id}" registers again with tool "{tool}""#)]
fn server_registers_again(
    world: &mut GatewayWorld,
    id: String,
    tool: String,
) -> Result<(), eyre::Report> {
    let descriptor = build_descriptor(&ServerId::new(id)?, &tool)?;
    world.last_registration = Some(run_async(world.gateway.register_server(descriptor)));
    Ok(())
}
