//! The command surface every component exposes, and its RPC-backed
//! implementation.

use crate::component::{ComponentRegistration, ComponentState};
use crate::error::RpcError;
use crate::logfabric::LogSinks;
use crate::rpc::RpcClient;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Wire method names of the component command surface.
pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const CONFIGURE: &str = "configure";
    pub const GET_STATE: &str = "getState";
    pub const START_RUN: &str = "startRun";
    pub const STOP_RUN: &str = "stopRun";
    pub const FORCED_STOP: &str = "forcedStop";
    pub const RESET: &str = "reset";
    pub const LOG_TO: &str = "logTo";
    pub const GET_BEAN_FIELDS: &str = "getBeanFields";
    pub const GET_MONITOR_SNAPSHOT: &str = "getMonitorSnapshot";
    pub const PREPARE_SUBRUN: &str = "prepareSubrun";
    pub const START_SUBRUN: &str = "startSubrun";
    pub const COMMIT_SUBRUN: &str = "commitSubrun";
}

/// One downstream target a producer must open a connection to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringEntry {
    #[serde(rename = "type")]
    pub conn_type: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub num: u32,
}

/// Light-source settings for one source channel during a subrun.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlasherSetting {
    /// Instance number of the source component that owns the channel.
    pub hub: u32,
    pub mbid: String,
    pub brightness: u32,
    pub width: u32,
    pub delay: u32,
    pub mask: u32,
    pub rate: u32,
}

/// Every bean and field a component exposes, `bean -> field -> value`.
pub type MonitorSnapshot = BTreeMap<String, Map<String, Value>>;

/// Commands the coordinator issues to a component.
///
/// State-changing calls answer with the state the component reached.
#[async_trait]
pub trait ComponentClient: Send + Sync {
    async fn connect(&self, wiring: &[WiringEntry]) -> Result<ComponentState, RpcError>;

    async fn configure(&self, config_name: &str) -> Result<ComponentState, RpcError>;

    async fn get_state(&self) -> Result<ComponentState, RpcError>;

    async fn start_run(&self, run_number: u32) -> Result<ComponentState, RpcError>;

    async fn stop_run(&self) -> Result<ComponentState, RpcError>;

    async fn force_stop(&self) -> Result<ComponentState, RpcError>;

    async fn reset(&self) -> Result<ComponentState, RpcError>;

    async fn log_to(&self, sinks: &LogSinks) -> Result<(), RpcError>;

    async fn get_bean_fields(
        &self,
        bean: &str,
        fields: &[String],
    ) -> Result<Map<String, Value>, RpcError>;

    async fn get_monitor_snapshot(&self) -> Result<MonitorSnapshot, RpcError>;

    async fn prepare_subrun(&self, subrun: u32) -> Result<(), RpcError>;

    /// Returns the latest payload time the source has emitted.
    async fn start_subrun(&self, settings: &[FlasherSetting]) -> Result<i64, RpcError>;

    async fn commit_subrun(&self, subrun: u32, latest_time: i64) -> Result<(), RpcError>;
}

/// A component reached over the JSON-lines RPC transport.
pub struct RemoteComponent {
    rpc: RpcClient,
}

impl RemoteComponent {
    pub fn new(registration: &ComponentRegistration, call_timeout: Duration) -> Self {
        Self {
            rpc: RpcClient::new(&registration.host, registration.cmd_port, call_timeout),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let value = self.rpc.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("bad '{}' result: {}", method, e)))
    }
}

#[async_trait]
impl ComponentClient for RemoteComponent {
    async fn connect(&self, wiring: &[WiringEntry]) -> Result<ComponentState, RpcError> {
        self.call(methods::CONNECT, json!({ "wiring": wiring })).await
    }

    async fn configure(&self, config_name: &str) -> Result<ComponentState, RpcError> {
        self.call(methods::CONFIGURE, json!({ "config": config_name }))
            .await
    }

    async fn get_state(&self) -> Result<ComponentState, RpcError> {
        self.call(methods::GET_STATE, Value::Null).await
    }

    async fn start_run(&self, run_number: u32) -> Result<ComponentState, RpcError> {
        self.call(methods::START_RUN, json!({ "run": run_number })).await
    }

    async fn stop_run(&self) -> Result<ComponentState, RpcError> {
        self.call(methods::STOP_RUN, Value::Null).await
    }

    async fn force_stop(&self) -> Result<ComponentState, RpcError> {
        self.call(methods::FORCED_STOP, Value::Null).await
    }

    async fn reset(&self) -> Result<ComponentState, RpcError> {
        self.call(methods::RESET, Value::Null).await
    }

    async fn log_to(&self, sinks: &LogSinks) -> Result<(), RpcError> {
        self.rpc
            .call(methods::LOG_TO, json!({ "sinks": sinks }))
            .await
            .map(|_| ())
    }

    async fn get_bean_fields(
        &self,
        bean: &str,
        fields: &[String],
    ) -> Result<Map<String, Value>, RpcError> {
        self.call(
            methods::GET_BEAN_FIELDS,
            json!({ "bean": bean, "fields": fields }),
        )
        .await
    }

    async fn get_monitor_snapshot(&self) -> Result<MonitorSnapshot, RpcError> {
        self.call(methods::GET_MONITOR_SNAPSHOT, Value::Null).await
    }

    async fn prepare_subrun(&self, subrun: u32) -> Result<(), RpcError> {
        self.rpc
            .call(methods::PREPARE_SUBRUN, json!({ "subrun": subrun }))
            .await
            .map(|_| ())
    }

    async fn start_subrun(&self, settings: &[FlasherSetting]) -> Result<i64, RpcError> {
        self.call(methods::START_SUBRUN, json!({ "settings": settings }))
            .await
    }

    async fn commit_subrun(&self, subrun: u32, latest_time: i64) -> Result<(), RpcError> {
        self.rpc
            .call(
                methods::COMMIT_SUBRUN,
                json!({ "subrun": subrun, "latestTime": latest_time }),
            )
            .await
            .map(|_| ())
    }
}
