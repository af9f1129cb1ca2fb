//! Serves any [`ComponentClient`] implementation over the RPC transport.
//!
//! This is the worker side of [`RemoteComponent`](super::RemoteComponent):
//! a process wraps its component in a `ComponentService` and hands it to an
//! [`RpcServer`](crate::rpc::RpcServer).

use super::client::{methods, ComponentClient, FlasherSetting, WiringEntry};
use crate::logfabric::LogSinks;
use crate::rpc::{param, to_value, RpcFault, RpcHandler};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct ComponentService {
    component: Arc<dyn ComponentClient>,
}

impl ComponentService {
    pub fn new(component: Arc<dyn ComponentClient>) -> Self {
        Self { component }
    }
}

#[async_trait]
impl RpcHandler for ComponentService {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcFault> {
        let c = &self.component;
        match method {
            methods::CONNECT => {
                let wiring: Vec<WiringEntry> = param(&params, "wiring")?;
                to_value(c.connect(&wiring).await?)
            }
            methods::CONFIGURE => {
                let config: String = param(&params, "config")?;
                to_value(c.configure(&config).await?)
            }
            methods::GET_STATE => to_value(c.get_state().await?),
            methods::START_RUN => {
                let run: u32 = param(&params, "run")?;
                to_value(c.start_run(run).await?)
            }
            methods::STOP_RUN => to_value(c.stop_run().await?),
            methods::FORCED_STOP => to_value(c.force_stop().await?),
            methods::RESET => to_value(c.reset().await?),
            methods::LOG_TO => {
                let sinks: LogSinks = param(&params, "sinks")?;
                c.log_to(&sinks).await?;
                Ok(Value::Null)
            }
            methods::GET_BEAN_FIELDS => {
                let bean: String = param(&params, "bean")?;
                let fields: Vec<String> = param(&params, "fields")?;
                to_value(c.get_bean_fields(&bean, &fields).await?)
            }
            methods::GET_MONITOR_SNAPSHOT => to_value(c.get_monitor_snapshot().await?),
            methods::PREPARE_SUBRUN => {
                let subrun: u32 = param(&params, "subrun")?;
                c.prepare_subrun(subrun).await?;
                Ok(Value::Null)
            }
            methods::START_SUBRUN => {
                let settings: Vec<FlasherSetting> = param(&params, "settings")?;
                to_value(c.start_subrun(&settings).await?)
            }
            methods::COMMIT_SUBRUN => {
                let subrun: u32 = param(&params, "subrun")?;
                let latest: i64 = param(&params, "latestTime")?;
                c.commit_subrun(subrun, latest).await?;
                Ok(Value::Null)
            }
            other => Err(RpcFault::unknown_method(other)),
        }
    }
}
