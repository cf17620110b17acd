//! Given steps for gateway routing BDD scenarios.

use super::world::{GatewayWorld, build_descriptor, parse_ids, run_async};
use eyre::WrapErr;
use rstest_bdd_macros::given;
use toolmesh::gateway::domain::ServerId;
use toolmesh::gateway::ports::TransportError;

#[given(r#"servers "{ids}" providing tool "{tool}""#)]
fn servers_providing_tool(
    world: &mut GatewayWorld,
    ids: String,
    tool: String,
) -> Result<(), eyre::Report> {
    for id in parse_ids(&ids)? {
        let descriptor = build_descriptor(&id, &tool)?;
        run_async(world.gateway.register_server(descriptor))
            .wrap_err_with(|| format!("register {id} for scenario"))?;
    }
    Ok(())
}

#[given(r#"server "{id}" fails {count:u32} consecutive health probes"#)]
fn server_fails_probes(world: &mut GatewayWorld, id: String, count: u32) -> Result<(), eyre::Report> {
    let server_id = ServerId::new(id)?;
    world.servers.set_unhealthy(&server_id, "scripted probe failure");
    for _ in 0..count {
        run_async(world.gateway.run_health_cycle());
    }
    Ok(())
}

#[given(r#"server "{id}" drops every connection"#)]
fn server_drops_connections(world: &mut GatewayWorld, id: String) -> Result<(), eyre::Report> {
    let server_id = ServerId::new(id)?;
    world.servers.set_failing(
        &server_id,
        TransportError::io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "scripted connection reset",
        )),
    );
    Ok(())
}
