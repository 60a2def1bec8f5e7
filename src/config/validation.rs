use std::{collections::HashSet, net::SocketAddr};

use hyper::Method;

use crate::{
    config::models::{GatewayDriver, ManagerConfig, TlsConfig},
    core::api::{ApiSpec, is_valid_name},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Duplicate api name '{name}'")]
    DuplicateApi { name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Manager configuration validator
pub struct ManagerConfigValidator;

impl ManagerConfigValidator {
    /// Validate the entire configuration, reporting every problem at once
    pub fn validate(config: &ManagerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (field, address) in [
            ("listen_addr", &config.listen_addr),
            ("admin_addr", &config.admin_addr),
        ] {
            if let Err(e) = Self::validate_listen_address(field, address) {
                errors.push(e);
            }
        }

        if !is_valid_name(&config.organization) {
            errors.push(ValidationError::InvalidField {
                field: "organization".to_string(),
                message: "Must only contain word characters and '-'".to_string(),
            });
        }

        if let Err(e) = Self::validate_url(&config.function_manager.url, "function_manager.url") {
            errors.push(e);
        }

        if config.gateway.driver == GatewayDriver::Kong {
            if let Err(e) = Self::validate_url(&config.gateway.kong.host, "gateway.kong.host") {
                errors.push(e);
            }
            if config.gateway.kong.upstream.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "gateway.kong.upstream".to_string(),
                });
            }
        }

        if config.gateway.max_form_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "gateway.max_form_bytes".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        match config.controller.resync_period() {
            Ok(period) if period.is_zero() => errors.push(ValidationError::InvalidField {
                field: "controller.resync_period".to_string(),
                message: "Must be greater than 0".to_string(),
            }),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidField {
                field: "controller.resync_period".to_string(),
                message: e.to_string(),
            }),
        }

        if config.controller.workers == 0 {
            errors.push(ValidationError::InvalidField {
                field: "controller.workers".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Some(tls) = &config.tls {
            if let Err(e) = Self::validate_tls_config(tls) {
                errors.push(e);
            }
        }

        let mut seen = HashSet::new();
        for spec in &config.apis {
            errors.extend(Self::validate_api(spec));
            if !seen.insert(spec.name.as_str()) {
                errors.push(ValidationError::DuplicateApi {
                    name: spec.name.clone(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(field: &str, address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: format!(
                    "{field} must be in format 'IP:PORT' (e.g., '127.0.0.1:8080' or '0.0.0.0:8081')"
                ),
            });
        }
        Ok(())
    }

    /// Validate a single declared API
    fn validate_api(spec: &ApiSpec) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let context = format!("apis.{}", spec.name);

        if !is_valid_name(&spec.name) {
            errors.push(ValidationError::InvalidField {
                field: format!("{context}.name"),
                message: "Must only contain word characters and '-'".to_string(),
            });
        }

        if spec.function.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("{context}.function"),
            });
        }

        for method in &spec.methods {
            if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context}.methods"),
                    message: format!("'{method}' is not a valid HTTP method"),
                });
            }
        }

        for protocol in &spec.protocols {
            if !matches!(protocol.to_ascii_lowercase().as_str(), "http" | "https") {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context}.protocols"),
                    message: format!("'{protocol}' must be 'http' or 'https'"),
                });
            }
        }

        errors
    }

    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_tls_config(config: &TlsConfig) -> ValidationResult<()> {
        if !std::path::Path::new(&config.cert_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Certificate file does not exist: {}", config.cert_path),
            });
        }

        if !std::path::Path::new(&config.key_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Private key file does not exist: {}", config.key_path),
            });
        }

        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
