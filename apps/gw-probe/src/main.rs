//! 驱动调试命令行：对单个通道执行读、写、设备扫描与对象扫描，结果以 JSON 输出。
//!
//! ```text
//! gw-probe drivers
//! gw-probe read --protocol bacnet-ip --config '{"device_id":1234}' --point analog-input:1@float32
//! gw-probe write --protocol opc-ua --config '{"endpoint":"opc.tcp://plc:4840"}' --point 'ns=2;s=Sp@int16' --value 42
//! gw-probe scan --protocol bacnet-ip --params '{"low_limit":0,"high_limit":5000}'
//! gw-probe scan-objects --protocol opc-ua --config '{"endpoint":"opc.tcp://plc:4840"}'
//! ```

use clap::{Args, Parser, Subcommand};
use domain::{DataType, DriverConfig, Point};
use gw_config::{GatewayConfig, read_optional, read_required};
use gw_protocol::{Driver, DriverContext, DriverRegistry, DriverTuning, register_all};
use gw_telemetry::{init_tracing, metrics};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gw-probe", about = "网关协议驱动调试工具")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Target {
    /// 协议注册名，缺省读取 GW_PROBE_PROTOCOL
    #[arg(long)]
    protocol: Option<String>,
    /// 驱动配置 JSON 对象，缺省读取 GW_PROBE_CONFIG
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// 列出已注册的驱动
    Drivers,
    /// 批量读取点位
    Read {
        #[command(flatten)]
        target: Target,
        /// `地址@类型`，可重复
        #[arg(long = "point", required = true)]
        points: Vec<String>,
    },
    /// 写入单个点位
    Write {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        point: String,
        /// JSON 值；无法解析为 JSON 时按字符串处理
        #[arg(long)]
        value: String,
    },
    /// 设备发现
    Scan {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        params: Option<String>,
    },
    /// 对象 / 节点扫描
    ScanObjects {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        params: Option<String>,
    },
}

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env()?;
    init_tracing();

    let cli = Cli::parse();
    let tuning = DriverTuning::from(&config);
    let mut registry = DriverRegistry::new();
    register_all(&mut registry, &tuning);

    let ctx = DriverContext::new(Duration::from_millis(config.default_timeout_ms));
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling driver call");
            cancel.cancel();
        }
    });

    let output = match cli.command {
        Command::Drivers => json!(registry.names()),
        Command::Read { target, points } => {
            let points = points
                .iter()
                .map(|spec| parse_point(spec))
                .collect::<Result<Vec<_>, _>>()?;
            let driver = open(&registry, &target, &ctx).await?;
            let result = driver.read_points(&ctx, &points).await;
            driver.disconnect().await?;
            let values: BTreeMap<String, Value> = result?
                .into_iter()
                .map(|(id, v)| {
                    let record = json!({
                        "value": v.value.to_json(),
                        "quality": v.quality,
                        "ts_ms": v.ts_ms,
                    });
                    (id, record)
                })
                .collect();
            json!(values)
        }
        Command::Write { target, point, value } => {
            let point = parse_point(&point)?;
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let driver = open(&registry, &target, &ctx).await?;
            let result = driver.write_point(&ctx, &point, &value).await;
            driver.disconnect().await?;
            result?;
            json!({ "ok": true, "point": point.address })
        }
        Command::Scan { target, params } => {
            let params = parse_object(params.as_deref())?;
            let driver = open(&registry, &target, &ctx).await?;
            let result = match driver.as_scanner() {
                Some(scanner) => scanner.scan(&ctx, &params).await,
                None => Err(gw_protocol::DriverError::Unsupported("scan".to_string())),
            };
            driver.disconnect().await?;
            result?
        }
        Command::ScanObjects { target, params } => {
            let params = parse_object(params.as_deref())?;
            let driver = open(&registry, &target, &ctx).await?;
            let result = match driver.as_object_scanner() {
                Some(scanner) => scanner.scan_objects(&ctx, &params).await,
                None => Err(gw_protocol::DriverError::Unsupported("scan-objects".to_string())),
            };
            driver.disconnect().await?;
            result?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    tracing::info!(metrics = ?metrics().snapshot(), "probe finished");
    Ok(())
}

/// 创建、初始化并连接驱动
async fn open(
    registry: &DriverRegistry,
    target: &Target,
    ctx: &DriverContext,
) -> Result<Box<dyn Driver>, BoxError> {
    let protocol = match &target.protocol {
        Some(protocol) => protocol.clone(),
        None => read_required("GW_PROBE_PROTOCOL")?,
    };
    let raw = target.config.clone().or_else(|| read_optional("GW_PROBE_CONFIG"));
    let config = parse_object(raw.as_deref())?;

    let mut driver = registry.get_driver(&protocol)?;
    let mut driver_config = DriverConfig::new(protocol.clone(), config);
    driver_config.channel_id = "probe".to_string();
    driver.init(&driver_config)?;
    driver.connect(ctx).await?;
    tracing::info!(%protocol, health = ?driver.health(), "driver connected");
    Ok(driver)
}

/// `地址@类型`，类型缺省为 float64
fn parse_point(spec: &str) -> Result<Point, BoxError> {
    let (address, data_type) = match spec.rsplit_once('@') {
        Some((address, data_type)) => (address, data_type.parse::<DataType>()?),
        None => (spec, DataType::Float64),
    };
    if address.trim().is_empty() {
        return Err(format!("empty point address: {spec}").into());
    }
    Ok(Point::new(address.trim(), address.trim(), data_type))
}

fn parse_object(raw: Option<&str>) -> Result<Map<String, Value>, BoxError> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a JSON object, got {other}").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_spec() {
        let point = parse_point("analog-input:1@float32").unwrap();
        assert_eq!(point.address, "analog-input:1");
        assert_eq!(point.data_type, DataType::Float32);

        let point = parse_point("ns=2;s=Temp").unwrap();
        assert_eq!(point.data_type, DataType::Float64);

        assert!(parse_point("40001@decimal").is_err());
        assert!(parse_point("@int16").is_err());
    }

    #[test]
    fn object_params() {
        assert!(parse_object(None).unwrap().is_empty());
        assert_eq!(parse_object(Some(r#"{"port":47808}"#)).unwrap()["port"], json!(47808));
        assert!(parse_object(Some("[1,2]")).is_err());
    }
}
