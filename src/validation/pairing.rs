use garde::Validate;

use crate::error::{AppError, Result};
use crate::models::client::{DeviceInfo, Role};
use crate::models::pairing::PairingRequest;

/// Most device metadata entries accepted with a pairing request.
pub const MAX_DEVICE_INFO_ENTRIES: usize = 32;
/// Longest accepted device metadata key or value.
pub const MAX_DEVICE_INFO_FIELD: usize = 256;

/// Validates a client or user identifier.
///
/// # Arguments
///
/// * `field` - Name used in the error message.
/// * `value` - The identifier to validate.
///
/// # Returns
///
/// A `Result<()>` indicating whether the identifier is valid.
pub fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::Validation(format!("{} must not be empty", field)));
    }

    if value.len() > 128 {
        return Err(AppError::Validation(format!(
            "{} must be at most 128 characters",
            field
        )));
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '@'))
    {
        return Err(AppError::Validation(format!(
            "{} can only contain letters, numbers and _ - . : @",
            field
        )));
    }

    Ok(())
}

/// Validates device metadata size.
pub fn validate_device_info(device_info: &DeviceInfo) -> Result<()> {
    if device_info.len() > MAX_DEVICE_INFO_ENTRIES {
        return Err(AppError::Validation(format!(
            "Device info must have at most {} entries",
            MAX_DEVICE_INFO_ENTRIES
        )));
    }

    if device_info
        .iter()
        .any(|(k, v)| k.len() > MAX_DEVICE_INFO_FIELD || v.len() > MAX_DEVICE_INFO_FIELD)
    {
        return Err(AppError::Validation(format!(
            "Device info fields must be at most {} characters",
            MAX_DEVICE_INFO_FIELD
        )));
    }

    Ok(())
}

/// Validates a pairing request and resolves its role.
///
/// # Arguments
///
/// * `request` - The inbound request.
///
/// # Returns
///
/// The requested `Role`. Nothing is touched when validation fails.
pub fn validate_pairing_request(request: &PairingRequest) -> Result<Role> {
    request
        .validate()
        .map_err(|report| AppError::Validation(report.to_string()))?;

    validate_identifier("user_id", &request.user_id)?;
    validate_identifier("client_id", &request.client_id)?;
    validate_device_info(&request.device_info)?;

    request.role.parse()
}
