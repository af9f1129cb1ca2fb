//! The coordinator's public RPC surface.

use super::Coordinator;
use crate::component::{ComponentId, ComponentRegistration, FlasherSetting};
use crate::logfabric::SinkAddr;
use crate::rpc::{param, param_or, to_value, RpcFault, RpcHandler};
use crate::runset::RunOptions;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// Method names understood by [`CoordinatorService`].
pub mod methods {
    pub const PING: &str = "ping";
    pub const REGISTER_COMPONENT: &str = "register_component";
    pub const UNREGISTER_COMPONENT: &str = "unregister_component";
    pub const LIST_COMPONENTS: &str = "list_components";
    pub const CENSUS: &str = "census";
    pub const MAKE_RUNSET: &str = "make_runset";
    pub const RUNSET_START_RUN: &str = "runset_start_run";
    pub const RUNSET_STOP_RUN: &str = "runset_stop_run";
    pub const RUNSET_STATE: &str = "runset_state";
    pub const RUNSET_SNAPSHOT: &str = "runset_snapshot";
    pub const RUNSET_LIST_IDS: &str = "runset_list_ids";
    pub const RUNSET_LIST: &str = "runset_list";
    pub const RUNSET_BREAK: &str = "runset_break";
    pub const RUNSET_SUBRUN: &str = "runset_subrun";
    pub const NEXT_RUN_NUMBER: &str = "next_run_number";
    pub const LOG_TO: &str = "log_to";
    pub const CLOSE_LOG: &str = "close_log";
}

pub struct CoordinatorService {
    coordinator: Coordinator,
}

impl CoordinatorService {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl RpcHandler for CoordinatorService {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcFault> {
        debug!("coordinator call {}", method);
        let cnc = &self.coordinator;
        match method {
            methods::PING => Ok(json!("pong")),
            methods::REGISTER_COMPONENT => {
                let registration: ComponentRegistration = serde_json::from_value(params)
                    .map_err(|e| RpcFault::invalid_request(format!("bad registration: {}", e)))?;
                to_value(cnc.register_component(registration)?)
            }
            methods::UNREGISTER_COMPONENT => {
                let id: ComponentId = param(&params, "id")?;
                cnc.unregister_component(id);
                Ok(Value::Null)
            }
            methods::LIST_COMPONENTS => to_value(cnc.list_components()),
            methods::CENSUS => to_value(cnc.census()),
            methods::MAKE_RUNSET => {
                let config: String = param(&params, "config")?;
                let strict: Option<bool> = param_or(&params, "strict", None)?;
                to_value(cnc.make_runset(&config, strict)?)
            }
            methods::RUNSET_START_RUN => {
                let id: u32 = param(&params, "id")?;
                let run: u32 = param(&params, "run")?;
                let options: RunOptions = param_or(&params, "options", RunOptions::default())?;
                to_value(cnc.runset_start_run(id, run, options).await?)
            }
            methods::RUNSET_STOP_RUN => {
                let id: u32 = param(&params, "id")?;
                to_value(cnc.runset_stop_run(id).await?)
            }
            methods::RUNSET_STATE => {
                let id: u32 = param(&params, "id")?;
                to_value(cnc.runset_state(id)?)
            }
            methods::RUNSET_SNAPSHOT => {
                let id: u32 = param(&params, "id")?;
                to_value(cnc.runset_snapshot(id)?)
            }
            methods::RUNSET_LIST_IDS => to_value(cnc.runset_list_ids()),
            methods::RUNSET_LIST => {
                let id: u32 = param(&params, "id")?;
                to_value(cnc.runset_list(id)?)
            }
            methods::RUNSET_BREAK => {
                let id: u32 = param(&params, "id")?;
                to_value(cnc.runset_break(id).await?)
            }
            methods::RUNSET_SUBRUN => {
                let id: u32 = param(&params, "id")?;
                let settings: Vec<FlasherSetting> = param_or(&params, "settings", Vec::new())?;
                to_value(cnc.runset_subrun(id, settings).await?)
            }
            methods::NEXT_RUN_NUMBER => to_value(cnc.next_run_number()?),
            methods::LOG_TO => {
                let host: String = param(&params, "host")?;
                let port: u16 = param(&params, "port")?;
                cnc.log_to(SinkAddr::new(host, port)).await;
                Ok(Value::Null)
            }
            methods::CLOSE_LOG => {
                cnc.close_log();
                Ok(Value::Null)
            }
            other => Err(RpcFault::unknown_method(other)),
        }
    }
}
