//! 配置校验模块
//!
//! 校验规则：
//! - 字段范围 (validator derive 规则)
//! - 传感器 id 非负且不重复
//! - inject_on_start 必须在 supported_mock_sensors 之内
//! - 单帧必须能放进待发送队列

use std::collections::HashSet;

use contracts::{BrokerConfig, ContractError, SensorId};
use validator::{Validate, ValidationErrors};

/// 校验 BrokerConfig
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(config: &BrokerConfig) -> Result<(), ContractError> {
    config.validate().map_err(from_validation_errors)?;
    validate_sensor_lists(config)?;
    validate_mock_injection(config)?;
    validate_transport_bounds(config)?;
    Ok(())
}

/// 把 derive 规则的错误折叠成第一条字段错误
fn from_validation_errors(errors: ValidationErrors) -> ContractError {
    let mut fields: Vec<(String, String)> = Vec::new();
    collect_errors("", &errors, &mut fields);
    fields.sort();
    match fields.into_iter().next() {
        Some((field, message)) => ContractError::config_validation(field, message),
        None => ContractError::config_validation("<root>", errors.to_string()),
    }
}

fn collect_errors(prefix: &str, errors: &ValidationErrors, out: &mut Vec<(String, String)>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            validator::ValidationErrorsKind::Field(list) => {
                for e in list {
                    let message = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("failed rule '{}'", e.code));
                    out.push((path.clone(), message));
                }
            }
            validator::ValidationErrorsKind::Struct(inner) => collect_errors(&path, inner, out),
            validator::ValidationErrorsKind::List(items) => {
                for (idx, inner) in items {
                    collect_errors(&format!("{path}[{idx}]"), inner, out);
                }
            }
        }
    }
}

fn validate_sensor_lists(config: &BrokerConfig) -> Result<(), ContractError> {
    check_ids("service.freezing_exempt", &config.service.freezing_exempt)?;
    check_ids("hdi.supported_mock_sensors", &config.hdi.supported_mock_sensors)?;
    check_ids("hdi.inject_on_start", &config.hdi.inject_on_start)?;
    Ok(())
}

/// id 非负且列表内唯一
fn check_ids(field: &str, ids: &[SensorId]) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !id.is_valid() {
            return Err(ContractError::config_validation(
                field,
                format!("invalid sensor id {id}"),
            ));
        }
        if !seen.insert(*id) {
            return Err(ContractError::config_validation(
                field,
                format!("duplicate sensor id {id}"),
            ));
        }
    }
    Ok(())
}

fn validate_mock_injection(config: &BrokerConfig) -> Result<(), ContractError> {
    let supported: HashSet<_> = config.hdi.supported_mock_sensors.iter().collect();
    if let Some(id) = config
        .hdi
        .inject_on_start
        .iter()
        .find(|id| !supported.contains(id))
    {
        return Err(ContractError::config_validation(
            "hdi.inject_on_start",
            format!("sensor {id} is not in supported_mock_sensors"),
        ));
    }
    Ok(())
}

fn validate_transport_bounds(config: &BrokerConfig) -> Result<(), ContractError> {
    let transport = &config.transport;
    if transport.max_packet_size as usize > transport.pending_queue_capacity {
        return Err(ContractError::config_validation(
            "transport.max_packet_size / transport.pending_queue_capacity",
            format!(
                "max_packet_size ({}) must be <= pending_queue_capacity ({})",
                transport.max_packet_size, transport.pending_queue_capacity
            ),
        ));
    }
    Ok(())
}
