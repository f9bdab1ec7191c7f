//! 内置运维工具：在共享的内存 ServiceState 上做确定性模拟
//!
//! 供二进制演示与测试使用；风险等级与资源足迹按真实运维动作声明。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::safety::RiskTier;
use crate::tools::footprint::ResourceFootprint;
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{EchoTool, Tool, ToolError, ToolRegistry};

/// 一封已发送的邮件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
struct ServiceInfo {
    healthy: bool,
    version: String,
    previous_version: Option<String>,
}

#[derive(Debug)]
struct Inner {
    disk_usage_pct: u8,
    log_gb: u32,
    databases: BTreeMap<String, Vec<String>>,
    services: BTreeMap<String, ServiceInfo>,
    unreachable_hosts: BTreeSet<String>,
    outbox: Vec<SentEmail>,
    side_effects: Vec<String>,
}

/// 被模拟的基础设施
#[derive(Debug)]
pub struct ServiceState {
    inner: Mutex<Inner>,
}

impl Default for ServiceState {
    fn default() -> Self {
        let mut databases = BTreeMap::new();
        databases.insert("prod".to_string(), vec!["users".to_string(), "orders".to_string()]);
        databases.insert("staging".to_string(), vec!["users".to_string()]);
        let mut services = BTreeMap::new();
        services.insert(
            "api".to_string(),
            ServiceInfo {
                healthy: false,
                version: "2.1.0".into(),
                previous_version: Some("2.0.3".into()),
            },
        );
        services.insert(
            "web".to_string(),
            ServiceInfo {
                healthy: true,
                version: "1.8.2".into(),
                previous_version: Some("1.8.1".into()),
            },
        );
        Self {
            inner: Mutex::new(Inner {
                disk_usage_pct: 95,
                log_gb: 20,
                databases,
                services,
                unreachable_hosts: BTreeSet::from(["legacy-db".to_string()]),
                outbox: Vec::new(),
                side_effects: Vec::new(),
            }),
        }
    }
}

impl ServiceState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn disk_usage(&self) -> u8 {
        self.inner.lock().await.disk_usage_pct
    }

    pub async fn has_database(&self, name: &str) -> bool {
        self.inner.lock().await.databases.contains_key(name)
    }

    pub async fn outbox(&self) -> Vec<SentEmail> {
        self.inner.lock().await.outbox.clone()
    }

    /// 已发生的副作用（按发生顺序）
    pub async fn side_effects(&self) -> Vec<String> {
        self.inner.lock().await.side_effects.clone()
    }
}

/// 注册全部内置工具
pub fn builtin_registry(state: Arc<ServiceState>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(CheckDiskTool(Arc::clone(&state)));
    registry.register(CleanLogsTool(Arc::clone(&state)));
    registry.register(DeleteDatabaseTool(Arc::clone(&state)));
    registry.register(SendEmailTool(Arc::clone(&state)));
    registry.register(PingTool(Arc::clone(&state)));
    registry.register(RunSqlTool(Arc::clone(&state)));
    registry.register(CheckHttpTool(Arc::clone(&state)));
    registry.register(ReadLogsTool(Arc::clone(&state)));
    registry.register(RestartServiceTool(Arc::clone(&state)));
    registry.register(RollbackDeployTool(state));
    registry
}

#[derive(Deserialize, JsonSchema)]
struct PathArgs {
    /// 挂载点或目录，默认 /
    path: Option<String>,
}

/// 查看磁盘使用率
pub struct CheckDiskTool(Arc<ServiceState>);

#[async_trait]
impl Tool for CheckDiskTool {
    fn name(&self) -> &str {
        "check_disk"
    }
    fn description(&self) -> &str {
        "Report disk usage and the largest folder."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }
    fn footprint(&self, _args: &Value) -> ResourceFootprint {
        ResourceFootprint::none().read("disk")
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let _args: PathArgs = parse_args(args)?;
        let inner = self.0.lock_inner().await;
        let level = if inner.disk_usage_pct >= 90 { "CRITICAL" } else { "OK" };
        Ok(json!(format!(
            "{}% ({level}). Largest folder: /var/log ({}GB)",
            inner.disk_usage_pct, inner.log_gb
        )))
    }
}

/// 清理轮转日志
pub struct CleanLogsTool(Arc<ServiceState>);

#[async_trait]
impl Tool for CleanLogsTool {
    fn name(&self) -> &str {
        "clean_logs"
    }
    fn description(&self) -> &str {
        "Remove rotated log files under /var/log to free disk space."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }
    fn footprint(&self, _args: &Value) -> ResourceFootprint {
        ResourceFootprint::none().write("disk")
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let _args: PathArgs = parse_args(args)?;
        let mut inner = self.0.lock_inner().await;
        let freed = inner.log_gb;
        inner.log_gb = 0;
        inner.disk_usage_pct = inner.disk_usage_pct.saturating_sub(freed as u8);
        inner.side_effects.push(format!("clean_logs:{freed}GB"));
        Ok(json!(format!("freed {freed}GB")))
    }
}

#[derive(Deserialize, JsonSchema)]
struct DatabaseArgs {
    /// 数据库名
    db: String,
}

/// 删除数据库（高风险）
pub struct DeleteDatabaseTool(Arc<ServiceState>);

#[async_trait]
impl Tool for DeleteDatabaseTool {
    fn name(&self) -> &str {
        "delete_database"
    }
    fn description(&self) -> &str {
        "Permanently delete a database and all of its tables."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<DatabaseArgs>()
    }
    fn risk_tier(&self) -> RiskTier {
        RiskTier::High
    }
    fn footprint(&self, args: &Value) -> ResourceFootprint {
        db_resource(args).map_or_else(ResourceFootprint::none, |r| ResourceFootprint::none().write(r))
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: DatabaseArgs = parse_args(args)?;
        let mut inner = self.0.lock_inner().await;
        if inner.databases.remove(&args.db).is_none() {
            return Err(ToolError::Failed(format!("database '{}' does not exist", args.db)));
        }
        inner.side_effects.push(format!("delete_database:{}", args.db));
        Ok(json!(format!("database '{}' deleted", args.db)))
    }
}

#[derive(Deserialize, JsonSchema)]
struct EmailArgs {
    to: String,
    subject: String,
    body: String,
}

/// 发送邮件（中风险）
pub struct SendEmailTool(Arc<ServiceState>);

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }
    fn description(&self) -> &str {
        "Send an email notification to a recipient."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<EmailArgs>()
    }
    fn risk_tier(&self) -> RiskTier {
        RiskTier::Medium
    }
    fn footprint(&self, _args: &Value) -> ResourceFootprint {
        ResourceFootprint::none().write("outbox")
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: EmailArgs = parse_args(args)?;
        let mut inner = self.0.lock_inner().await;
        inner.side_effects.push(format!("send_email:{}", args.to));
        let summary = format!("email sent to {}", args.to);
        inner.outbox.push(SentEmail {
            to: args.to,
            subject: args.subject,
            body: args.body,
        });
        Ok(json!(summary))
    }
}

#[derive(Deserialize, JsonSchema)]
struct HostArgs {
    host: String,
}

/// 连通性检查
pub struct PingTool(Arc<ServiceState>);

#[async_trait]
impl Tool for PingTool {
    fn name(&self) -> &str {
        "ping"
    }
    fn description(&self) -> &str {
        "Check network reachability of a host."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<HostArgs>()
    }
    fn footprint(&self, args: &Value) -> ResourceFootprint {
        match args.get("host").and_then(Value::as_str) {
            Some(host) => ResourceFootprint::none().read(format!("net:{host}")),
            None => ResourceFootprint::none(),
        }
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: HostArgs = parse_args(args)?;
        let inner = self.0.lock_inner().await;
        if inner.unreachable_hosts.contains(&args.host) {
            return Err(ToolError::Failed(format!("host {} unreachable: 100% packet loss", args.host)));
        }
        Ok(json!(format!("{} reachable, rtt=12ms", args.host)))
    }
}

#[derive(Deserialize, JsonSchema)]
struct SqlArgs {
    db: String,
    query: String,
}

/// 执行 SQL（模拟）
pub struct RunSqlTool(Arc<ServiceState>);

impl RunSqlTool {
    fn is_read_only(query: &str) -> bool {
        let q = query.trim_start().to_ascii_lowercase();
        q.starts_with("select") || q.starts_with("show") || q.starts_with("explain")
    }
}

#[async_trait]
impl Tool for RunSqlTool {
    fn name(&self) -> &str {
        "run_sql"
    }
    fn description(&self) -> &str {
        "Run a SQL statement against a database and return a short result."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<SqlArgs>()
    }
    fn risk_tier(&self) -> RiskTier {
        RiskTier::Medium
    }
    fn footprint(&self, args: &Value) -> ResourceFootprint {
        let Some(db) = db_resource(args) else {
            return ResourceFootprint::none();
        };
        let read_only = args
            .get("query")
            .and_then(Value::as_str)
            .is_some_and(Self::is_read_only);
        if read_only {
            ResourceFootprint::none().read(db)
        } else {
            ResourceFootprint::none().write(db)
        }
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: SqlArgs = parse_args(args)?;
        let mut inner = self.0.lock_inner().await;
        let Some(tables) = inner.databases.get(&args.db).cloned() else {
            return Err(ToolError::Failed(format!("database '{}' does not exist", args.db)));
        };
        if Self::is_read_only(&args.query) {
            return Ok(json!({ "db": args.db, "tables": tables, "rows": 3 }));
        }
        inner.side_effects.push(format!("run_sql:{}", args.db));
        Ok(json!({ "db": args.db, "rows_affected": 1 }))
    }
}

#[derive(Deserialize, JsonSchema)]
struct UrlArgs {
    url: String,
}

/// HTTP 健康检查
pub struct CheckHttpTool(Arc<ServiceState>);

#[async_trait]
impl Tool for CheckHttpTool {
    fn name(&self) -> &str {
        "check_http"
    }
    fn description(&self) -> &str {
        "Probe a service health endpoint, e.g. http://api/health."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<UrlArgs>()
    }
    fn footprint(&self, args: &Value) -> ResourceFootprint {
        match args.get("url").and_then(Value::as_str).and_then(service_from_url) {
            Some(service) => ResourceFootprint::none().read(format!("service:{service}")),
            None => ResourceFootprint::none(),
        }
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: UrlArgs = parse_args(args)?;
        let service = service_from_url(&args.url)
            .ok_or_else(|| ToolError::InvalidArguments(format!("cannot parse url '{}'", args.url)))?;
        let inner = self.0.lock_inner().await;
        let Some(info) = inner.services.get(service) else {
            return Err(ToolError::Failed(format!("could not resolve host '{service}'")));
        };
        let status = if info.healthy { "200 OK" } else { "503 Service Unavailable" };
        Ok(json!({ "url": args.url, "status": status, "version": info.version }))
    }
}

#[derive(Deserialize, JsonSchema)]
struct ReadLogsArgs {
    service: String,
    /// 返回的行数，默认 3
    lines: Option<u32>,
}

/// 读取服务日志
pub struct ReadLogsTool(Arc<ServiceState>);

#[async_trait]
impl Tool for ReadLogsTool {
    fn name(&self) -> &str {
        "read_logs"
    }
    fn description(&self) -> &str {
        "Read the most recent log lines of a service."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<ReadLogsArgs>()
    }
    fn footprint(&self, args: &Value) -> ResourceFootprint {
        match args.get("service").and_then(Value::as_str) {
            Some(s) => ResourceFootprint::none().read(format!("service:{s}")),
            None => ResourceFootprint::none(),
        }
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: ReadLogsArgs = parse_args(args)?;
        let inner = self.0.lock_inner().await;
        let Some(info) = inner.services.get(&args.service) else {
            return Err(ToolError::Failed(format!("unknown service '{}'", args.service)));
        };
        let line = if info.healthy {
            format!("INFO {} v{} serving requests", args.service, info.version)
        } else {
            format!("ERROR {} v{} connection pool exhausted", args.service, info.version)
        };
        let n = args.lines.unwrap_or(3).min(50) as usize;
        Ok(json!(vec![line; n]))
    }
}

#[derive(Deserialize, JsonSchema)]
struct ServiceArgs {
    service: String,
}

/// 重启服务（中风险）
pub struct RestartServiceTool(Arc<ServiceState>);

#[async_trait]
impl Tool for RestartServiceTool {
    fn name(&self) -> &str {
        "restart_service"
    }
    fn description(&self) -> &str {
        "Restart a service process."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<ServiceArgs>()
    }
    fn risk_tier(&self) -> RiskTier {
        RiskTier::Medium
    }
    fn footprint(&self, args: &Value) -> ResourceFootprint {
        match args.get("service").and_then(Value::as_str) {
            Some(s) => ResourceFootprint::none().write(format!("service:{s}")),
            None => ResourceFootprint::none(),
        }
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: ServiceArgs = parse_args(args)?;
        let mut inner = self.0.lock_inner().await;
        let Some(info) = inner.services.get_mut(&args.service) else {
            return Err(ToolError::Failed(format!("unknown service '{}'", args.service)));
        };
        info.healthy = true;
        inner.side_effects.push(format!("restart_service:{}", args.service));
        Ok(json!(format!("{} restarted", args.service)))
    }
}

#[derive(Deserialize, JsonSchema)]
struct RollbackArgs {
    service: String,
    /// 目标版本，默认上一个版本
    version: Option<String>,
}

/// 回滚部署（高风险）
pub struct RollbackDeployTool(Arc<ServiceState>);

#[async_trait]
impl Tool for RollbackDeployTool {
    fn name(&self) -> &str {
        "rollback_deploy"
    }
    fn description(&self) -> &str {
        "Roll a service back to a previous deployment."
    }
    fn parameters_schema(&self) -> Value {
        schema_of::<RollbackArgs>()
    }
    fn risk_tier(&self) -> RiskTier {
        RiskTier::High
    }
    fn footprint(&self, args: &Value) -> ResourceFootprint {
        match args.get("service").and_then(Value::as_str) {
            Some(s) => ResourceFootprint::none().write(format!("service:{s}")),
            None => ResourceFootprint::none(),
        }
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: RollbackArgs = parse_args(args)?;
        let mut inner = self.0.lock_inner().await;
        let Some(info) = inner.services.get_mut(&args.service) else {
            return Err(ToolError::Failed(format!("unknown service '{}'", args.service)));
        };
        let target = args
            .version
            .or_else(|| info.previous_version.clone())
            .ok_or_else(|| ToolError::Failed(format!("{} has no previous version", args.service)))?;
        let from = std::mem::replace(&mut info.version, target.clone());
        info.previous_version = None;
        info.healthy = true;
        inner
            .side_effects
            .push(format!("rollback_deploy:{}:{}", args.service, target));
        Ok(json!(format!("{} rolled back from {from} to {target}", args.service)))
    }
}

impl ServiceState {
    async fn lock_inner(&self) -> tokio::sync::MutexGuard<'_, Inner> {
        self.inner.lock().await
    }
}

fn db_resource(args: &Value) -> Option<String> {
    args.get("db").and_then(Value::as_str).map(|db| format!("db:{db}"))
}

/// http://api/health -> api
fn service_from_url(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let host = rest.split(['/', ':']).next()?;
    (!host.is_empty()).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disk_cleanup_flow() {
        let state = ServiceState::new();
        let registry = builtin_registry(Arc::clone(&state));
        let check = registry.resolve("check_disk").unwrap();
        let out = check.execute(Value::Null).await.unwrap();
        assert!(out.as_str().unwrap().starts_with("95%"));
        let clean = registry.resolve("clean_logs").unwrap();
        assert_eq!(clean.execute(json!({})).await.unwrap(), json!("freed 20GB"));
        assert_eq!(state.disk_usage().await, 75);
    }

    #[tokio::test]
    async fn test_delete_database_mutates_state() {
        let state = ServiceState::new();
        let tool = DeleteDatabaseTool(Arc::clone(&state));
        assert_eq!(tool.risk_tier(), RiskTier::High);
        tool.execute(json!({"db": "prod"})).await.unwrap();
        assert!(!state.has_database("prod").await);
        assert!(tool.execute(json!({"db": "prod"})).await.is_err());
        assert_eq!(state.side_effects().await, vec!["delete_database:prod"]);
    }

    #[test]
    fn test_sql_footprint_depends_on_query() {
        let tool = RunSqlTool(ServiceState::new());
        let read = tool.footprint(&json!({"db": "prod", "query": "SELECT 1"}));
        let write = tool.footprint(&json!({"db": "prod", "query": "DELETE FROM users"}));
        assert!(!read.conflicts_with(&read.clone()));
        assert!(read.conflicts_with(&write));
    }

    #[test]
    fn test_service_from_url() {
        assert_eq!(service_from_url("http://api/health"), Some("api"));
        assert_eq!(service_from_url("web:8080"), Some("web"));
        assert_eq!(service_from_url("http:///x"), None);
    }
}
