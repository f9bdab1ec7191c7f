//! Echo 工具（演示与测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolError};

#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back unchanged."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EchoArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: EchoArgs = parse_args(args)?;
        Ok(Value::String(args.text))
    }
}
