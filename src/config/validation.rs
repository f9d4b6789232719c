use super::{ClientConfig, ConfigError};

/// Validate the full client config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &ClientConfig) -> Result<(), ConfigError> {
    validate_backend(config)?;
    validate_session(config)?;
    validate_dispatch(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_backend(config: &ClientConfig) -> Result<(), ConfigError> {
    let backend = &config.backend;
    let parsed = url::Url::parse(&backend.base_url).map_err(|err| {
        validation_err(format!("backend.base_url is not a valid URL: {err}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(
            "backend.base_url must start with http:// or https://",
        ));
    }
    if !backend.chat_path.starts_with('/') {
        return Err(validation_err("backend.chat_path must start with '/'"));
    }

    let has_token = backend
        .token
        .as_deref()
        .is_some_and(|token| !token.trim().is_empty());
    let has_token_env = backend
        .token_env
        .as_deref()
        .is_some_and(|name| !name.trim().is_empty());
    if backend.token.is_some() && !has_token {
        return Err(validation_err("backend.token cannot be empty when set"));
    }
    if !has_token && !has_token_env {
        return Err(validation_err(
            "backend must set either token or token_env",
        ));
    }

    validate_proxy_url("proxy", backend.proxy.as_deref())?;
    if backend.connect_timeout_secs == 0 {
        return Err(validation_err(
            "backend.connect_timeout_secs must be greater than 0",
        ));
    }
    if backend.pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "backend.pool_max_idle_per_host must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_proxy_url(field_name: &str, proxy: Option<&str>) -> Result<(), ConfigError> {
    let Some(proxy) = proxy.map(str::trim) else {
        return Ok(());
    };
    if proxy.is_empty() {
        return Err(validation_err(format!(
            "backend.{field_name} cannot be empty when set"
        )));
    }
    let parsed = url::Url::parse(proxy).map_err(|err| {
        validation_err(format!("backend.{field_name} is not a valid URL: {err}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "backend.{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_session(config: &ClientConfig) -> Result<(), ConfigError> {
    if config.session.idle_timeout_secs == Some(0) {
        return Err(validation_err(
            "session.idle_timeout_secs must be greater than 0 when set",
        ));
    }
    Ok(())
}

fn validate_dispatch(config: &ClientConfig) -> Result<(), ConfigError> {
    let dispatch = &config.dispatch;
    if dispatch.debounce_ms == 0 {
        return Err(validation_err("dispatch.debounce_ms must be greater than 0"));
    }
    if dispatch.followup_ms > dispatch.debounce_ms {
        return Err(validation_err(
            "dispatch.followup_ms must not exceed dispatch.debounce_ms",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &ClientConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
