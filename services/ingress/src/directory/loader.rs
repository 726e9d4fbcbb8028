//! Building a [`Directory`] from routing-file sections.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, info};

use super::{BackendDescriptor, Directory, Protocol};
use crate::error::ConfigError;

/// One backend block as written in the routing file. Every field is
/// optional so blocks can be layered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendBlock {
    pub host: Option<String>,
    pub port: Option<i64>,
    pub disabled: Option<bool>,
    pub proxy_protocol: Option<bool>,
    pub host_passthrough: Option<bool>,
}

/// Per-host (or per-template) configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub default: Option<BackendBlock>,
    pub http: Option<BackendBlock>,
    pub https: Option<BackendBlock>,
    pub quic: Option<BackendBlock>,
    /// Replace this host's blocks wholesale with a named template.
    pub template: Option<String>,
}

impl HostConfig {
    fn block(&self, protocol: Protocol) -> Option<&BackendBlock> {
        match protocol {
            Protocol::Http => self.http.as_ref(),
            Protocol::Https => self.https.as_ref(),
            Protocol::Quic => self.quic.as_ref(),
        }
    }
}

impl Directory {
    /// Build the directory from host entries, named templates and the
    /// global per-protocol defaults.
    ///
    /// For each host and protocol the layers are, highest priority first:
    /// the host's protocol block, the host's `default` block, the global
    /// protocol block, the global `default` block.
    pub fn load(
        hosts: &BTreeMap<String, HostConfig>,
        templates: &BTreeMap<String, HostConfig>,
        defaults: &HostConfig,
    ) -> Result<Directory, ConfigError> {
        if let Some(template) = &defaults.template {
            return Err(ConfigError::NestedTemplate {
                template: template.clone(),
            });
        }
        for (name, template) in templates {
            if template.template.is_some() {
                return Err(ConfigError::NestedTemplate {
                    template: name.clone(),
                });
            }
        }

        let mut builder = Directory::builder();

        for (pattern, raw) in hosts {
            let host = match &raw.template {
                Some(name) => templates
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownTemplate {
                        pattern: pattern.clone(),
                        template: name.clone(),
                    })?,
                None => raw,
            };

            builder = builder.note_pattern(pattern);

            for protocol in Protocol::ALL {
                let layers = [
                    host.block(protocol),
                    host.default.as_ref(),
                    defaults.block(protocol),
                    defaults.default.as_ref(),
                ];
                if let Some(descriptor) = assemble(pattern, protocol, &layers)? {
                    builder = builder.insert(protocol, pattern, descriptor);
                }
            }
        }

        let directory = builder.build();
        info!(
            http_hosts = directory.len(Protocol::Http),
            https_hosts = directory.len(Protocol::Https),
            quic_hosts = directory.len(Protocol::Quic),
            wildcard_enabled = directory.wildcard_enabled(),
            "Directory loaded"
        );
        Ok(directory)
    }
}

fn assemble(
    pattern: &str,
    protocol: Protocol,
    layers: &[Option<&BackendBlock>],
) -> Result<Option<BackendDescriptor>, ConfigError> {
    let blocks: Vec<&BackendBlock> = layers.iter().flatten().copied().collect();
    if blocks.is_empty() {
        return Ok(None);
    }

    let disabled = blocks.iter().find_map(|b| b.disabled).unwrap_or(false);
    if disabled {
        debug!(pattern, protocol = %protocol, "backend disabled");
        return Ok(None);
    }

    let host = blocks
        .iter()
        .find_map(|b| b.host.as_deref().filter(|h| !h.is_empty()))
        .ok_or_else(|| ConfigError::MissingHost {
            pattern: pattern.to_string(),
            protocol,
        })?;

    let port = blocks
        .iter()
        .find_map(|b| b.port.filter(|p| *p != 0))
        .ok_or_else(|| ConfigError::MissingPort {
            pattern: pattern.to_string(),
            protocol,
        })?;
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::InvalidPort {
            pattern: pattern.to_string(),
            protocol,
            port,
        })?;

    let proxy_protocol = blocks
        .iter()
        .find_map(|b| b.proxy_protocol)
        .unwrap_or(false);
    let host_passthrough = blocks
        .iter()
        .find_map(|b| b.host_passthrough)
        .unwrap_or(false);

    Ok(Some(
        BackendDescriptor::new(host, port)
            .with_proxy_protocol(proxy_protocol)
            .with_host_passthrough(host_passthrough),
    ))
}
