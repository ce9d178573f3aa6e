//! Demo methods served by `courier-rpc serve`.

use courier::{MethodCall, MethodCallHandler, MethodResult};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Answers the demo methods.
///
/// - `getBatteryLevel`: acknowledges with `"100"`
/// - `syncMethod`: acknowledges with `"ok"`
/// - `asynchronousMethod`: acknowledges, then delivers its arguments
/// - `failingMethod`: acknowledges, then delivers a `DEMO_FAILURE` error
pub struct DemoHandler {
    result_delay: Duration,
}

impl DemoHandler {
    pub const FAILURE_CODE: &'static str = "DEMO_FAILURE";

    pub fn new(result_delay: Duration) -> Self {
        Self { result_delay }
    }
}

impl MethodCallHandler for DemoHandler {
    fn on_method_call(&self, call: MethodCall, result: MethodResult) -> anyhow::Result<()> {
        debug!(method = %call.method, deferred = result.is_deferred(), "Demo call");

        match call.method.as_str() {
            "getBatteryLevel" => result.success("100"),
            "syncMethod" => result.success("ok"),
            "asynchronousMethod" => {
                result.success(Value::Null);
                let delay = self.result_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = result.success_async(call.arguments).await {
                        warn!(error = %e, "Failed to deliver asynchronousMethod result");
                    }
                });
            }
            "failingMethod" => {
                result.success(Value::Null);
                let delay = self.result_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let delivered = result
                        .error_async(
                            Self::FAILURE_CODE,
                            Some("failingMethod always fails".to_string()),
                            Some(call.arguments),
                        )
                        .await;
                    if let Err(e) = delivered {
                        warn!(error = %e, "Failed to deliver failingMethod error");
                    }
                });
            }
            _ => result.not_implemented(),
        }
        Ok(())
    }
}
