//! Configuration interpolation for environment variables.
//!
//! Values in env blocks and auth fields may reference process environment
//! variables as `${env:NAME}`. Secret stores are external collaborators; a
//! missing variable disables the owning upstream rather than failing the
//! whole configuration.

use crate::config::{AuthSettings, ProxyConfig, UpstreamConfig};
use manifold_types::EnvVar;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

static ENV_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{env:([\w+_-]*)}").expect("env pattern compiles"));

/// Interpolate environment references across the configuration.
///
/// An upstream whose values cannot be resolved is marked disabled and the
/// first error is logged; other upstreams are unaffected.
pub fn interpolate_config(config: &mut ProxyConfig) -> Result<(), InterpolationError> {
    for server in config.servers.iter_mut() {
        if let Err(e) = interpolate_server(server) {
            tracing::warn!(upstream = %server.name, error = %e, "disabling upstream: interpolation failed");
            server.disabled = Some(true);
        }
    }
    Ok(())
}

/// Interpolate values in a single upstream configuration.
fn interpolate_server(server: &mut UpstreamConfig) -> Result<(), InterpolationError> {
    if let Some(env) = &mut server.env {
        for EnvVar { value, .. } in env.iter_mut() {
            *value = interpolate_string(value)?;
        }
    }

    if let Some(auth) = &mut server.auth {
        interpolate_auth(auth)?;
    }

    Ok(())
}

fn interpolate_auth(auth: &mut AuthSettings) -> Result<(), InterpolationError> {
    for field in [&mut auth.token, &mut auth.username, &mut auth.password] {
        if let Some(value) = field {
            *value = interpolate_string(value)?;
        }
    }
    Ok(())
}

/// Replace every `${env:NAME}` occurrence in a string.
pub fn interpolate_string(value: &str) -> Result<String, InterpolationError> {
    let mut resolved = Vec::new();
    for cap in ENV_PATTERN.captures_iter(value) {
        let var_name = cap[1].to_string();
        let env_value = std::env::var(&var_name)
            .map_err(|_| InterpolationError::MissingEnvVar { name: var_name.clone() })?;
        debug!("interpolated env var: {} -> [REDACTED]", var_name);
        resolved.push((cap[0].to_string(), env_value));
    }

    let mut result = value.to_string();
    for (placeholder, env_value) in resolved {
        result = result.replace(&placeholder, &env_value);
    }
    Ok(result)
}

/// Errors that can occur during interpolation.
#[derive(Debug, Error)]
pub enum InterpolationError {
    #[error("Missing environment variable: {name}")]
    MissingEnvVar { name: String },
}
