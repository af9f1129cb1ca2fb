//! Operator-side client of the coordinator service.

use super::service::methods;
use super::Registration;
use crate::component::{ComponentRegistration, ComponentSnapshot, FlasherSetting};
use crate::error::{CncError, CncResult, RpcError, StatusCode};
use crate::registry::Census;
use crate::rpc::RpcClient;
use crate::runset::{BreakReport, MemberStatus, RunOptions, RunSetState};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

pub struct CoordinatorClient {
    rpc: RpcClient,
}

impl CoordinatorClient {
    /// `addr` is `host:port`. `timeout` bounds every call, including run
    /// starts that configure components first.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            rpc: RpcClient::with_addr(addr, timeout),
        }
    }

    pub fn addr(&self) -> &str {
        self.rpc.addr()
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> CncResult<T> {
        let value = self.rpc.call(method, params).await.map_err(remote_error)?;
        serde_json::from_value(value).map_err(|e| {
            CncError::Rpc(RpcError::Protocol(format!("bad '{}' result: {}", method, e)))
        })
    }

    pub async fn ping(&self) -> CncResult<String> {
        self.call(methods::PING, Value::Null).await
    }

    pub async fn register_component(
        &self,
        registration: &ComponentRegistration,
    ) -> CncResult<Registration> {
        let params = serde_json::to_value(registration)
            .map_err(|e| CncError::Internal(e.to_string()))?;
        self.call(methods::REGISTER_COMPONENT, params).await
    }

    pub async fn list_components(&self) -> CncResult<Vec<ComponentSnapshot>> {
        self.call(methods::LIST_COMPONENTS, Value::Null).await
    }

    pub async fn census(&self) -> CncResult<Census> {
        self.call(methods::CENSUS, Value::Null).await
    }

    pub async fn make_runset(&self, config: &str, strict: Option<bool>) -> CncResult<u32> {
        self.call(
            methods::MAKE_RUNSET,
            json!({ "config": config, "strict": strict }),
        )
        .await
    }

    pub async fn start_run(
        &self,
        id: u32,
        run_number: u32,
        options: &RunOptions,
    ) -> CncResult<RunSetState> {
        self.call(
            methods::RUNSET_START_RUN,
            json!({ "id": id, "run": run_number, "options": options }),
        )
        .await
    }

    pub async fn stop_run(&self, id: u32) -> CncResult<RunSetState> {
        self.call(methods::RUNSET_STOP_RUN, json!({ "id": id })).await
    }

    pub async fn state(&self, id: u32) -> CncResult<RunSetState> {
        self.call(methods::RUNSET_STATE, json!({ "id": id })).await
    }

    /// Full run-set snapshot, as json.
    pub async fn snapshot(&self, id: u32) -> CncResult<Value> {
        self.call(methods::RUNSET_SNAPSHOT, json!({ "id": id })).await
    }

    pub async fn runset_ids(&self) -> CncResult<Vec<u32>> {
        self.call(methods::RUNSET_LIST_IDS, Value::Null).await
    }

    pub async fn members(&self, id: u32) -> CncResult<Vec<MemberStatus>> {
        self.call(methods::RUNSET_LIST, json!({ "id": id })).await
    }

    pub async fn break_runset(&self, id: u32) -> CncResult<BreakReport> {
        self.call(methods::RUNSET_BREAK, json!({ "id": id })).await
    }

    pub async fn subrun(&self, id: u32, settings: &[FlasherSetting]) -> CncResult<u32> {
        self.call(
            methods::RUNSET_SUBRUN,
            json!({ "id": id, "settings": settings }),
        )
        .await
    }

    pub async fn next_run_number(&self) -> CncResult<u32> {
        self.call(methods::NEXT_RUN_NUMBER, Value::Null).await
    }

    pub async fn log_to(&self, host: &str, port: u16) -> CncResult<()> {
        let _: Value = self
            .call(methods::LOG_TO, json!({ "host": host, "port": port }))
            .await?;
        Ok(())
    }

    pub async fn close_log(&self) -> CncResult<()> {
        let _: Value = self.call(methods::CLOSE_LOG, Value::Null).await?;
        Ok(())
    }
}

/// Recovers the coordinator's status code from a fault.
fn remote_error(err: RpcError) -> CncError {
    match err {
        RpcError::Remote { code, message, .. } => {
            let status = serde_json::from_value(Value::String(code)).unwrap_or(StatusCode::Internal);
            CncError::Remote { status, message }
        }
        other => CncError::Rpc(other),
    }
}
