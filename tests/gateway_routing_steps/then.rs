//! Then steps for gateway routing BDD scenarios.

use super::world::{GatewayWorld, parse_ids};
use rstest_bdd_macros::then;
use toolmesh::gateway::domain::ServerId;
use toolmesh::gateway::services::{InvocationError, RegistryError, ServerFilter};

#[then(r#"each of "{ids}" served {count:u64} calls"#)]
fn each_served(world: &GatewayWorld, ids: String, count: u64) -> Result<(), eyre::Report> {
    for id in parse_ids(&ids)? {
        let served = world.servers.calls_to(&id);
        if served != count {
            return Err(eyre::eyre!("expected {id} to serve {count} calls, it served {served}"));
        }
    }
    Ok(())
}

#[then(r#"server "{id}" served {count:u64} calls"#)]
fn server_served(world: &GatewayWorld, id: String, count: u64) -> Result<(), eyre::Report> {
    let server_id = ServerId::new(id)?;
    let served = world.servers.calls_to(&server_id);
    if served != count {
        return Err(eyre::eyre!(
            "expected {server_id} to serve {count} calls, it served {served}"
        ));
    }
    Ok(())
}

#[then("every call succeeded")]
fn every_call_succeeded(world: &GatewayWorld) -> Result<(), eyre::Report> {
    if let Some(Err(err)) = world.call_results.iter().find(|result| result.is_err()) {
        return Err(eyre::eyre!("expected every call to succeed, got {err}"));
    }
    Ok(())
}

#[then(r#"server "{id}" is recorded as a failover source"#)]
fn failover_source(world: &GatewayWorld, id: String) -> Result<(), eyre::Report> {
    let server_id = ServerId::new(id)?;
    let count = world
        .gateway
        .failover_counts()
        .get(&server_id)
        .copied()
        .unwrap_or_default();
    if count == 0 {
        return Err(eyre::eyre!("expected failovers away from {server_id}"));
    }
    Ok(())
}

#[then("the last call failed because the tool is unknown")]
fn last_call_not_found(world: &GatewayWorld) -> Result<(), eyre::Report> {
    let last = world
        .call_results
        .last()
        .ok_or_else(|| eyre::eyre!("no call was made in this scenario"))?;
    if !matches!(last, Err(InvocationError::NotFound(_))) {
        return Err(eyre::eyre!("expected NotFound, got {last:?}"));
    }
    Ok(())
}

#[then("the registration is rejected as a conflict")]
fn registration_conflict(world: &GatewayWorld) -> Result<(), eyre::Report> {
    let result = world
        .last_registration
        .as_ref()
        .ok_or_else(|| eyre::eyre!("missing registration result in scenario world"))?;
    if !matches!(result, Err(RegistryError::Conflict { .. })) {
        return Err(eyre::eyre!("expected conflict, got {result:?}"));
    }
    Ok(())
}

#[then("the registry holds {count:usize} server")]
fn registry_holds(world: &GatewayWorld, count: usize) -> Result<(), eyre::Report> {
    let held = world.gateway.servers(&ServerFilter::all()).len();
    if held != count {
        return Err(eyre::eyre!("expected {count} registered servers, found {held}"));
    }
    Ok(())
}
