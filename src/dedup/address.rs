// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::errors::DedupError;
use std::path::Path;
use tracing::{debug, error};

/// Resolves the configured redis server to a `host:port` address.
///
/// `server` is either a literal `host:port` or the path of a file naming the
/// current master. File lines are `host:port` (any system) or
/// `<system>/host:port`; a line for `system` wins over a generic one.
pub fn resolve_redis_address(server: &str, system: &str) -> Result<String, DedupError> {
    let server = server.trim();

    if parse_host_port(server).is_some() && !Path::new(server).is_file() {
        return Ok(server.to_owned());
    }

    let content = std::fs::read_to_string(server).map_err(|err| {
        error!(error = err.to_string(), server, "failure to read redis server file");
        DedupError::InvalidAddress
    })?;

    let address = address_for_system(&content, system).ok_or_else(|| {
        error!(server, system, "no redis address for system in file");
        DedupError::InvalidAddress
    })?;

    debug!(server, address = address.as_str(), "redis address read from file");
    Ok(address)
}

/// Picks the address of `system` out of a master file's content.
pub fn address_for_system(content: &str, system: &str) -> Option<String> {
    let mut generic = None;

    for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match line.split_once('/') {
            Some((prefix, address)) if prefix == system => {
                if parse_host_port(address).is_some() {
                    return Some(address.to_owned());
                }
            }
            Some(_) => {}
            None => {
                if generic.is_none() && parse_host_port(line).is_some() {
                    generic = Some(line.to_owned());
                }
            }
        }
    }

    generic
}

/// Splits `host:port`, returning `None` unless both parts are well formed.
pub fn parse_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.split_once(':')?;
    if host.is_empty() || host.contains(':') || port.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}
