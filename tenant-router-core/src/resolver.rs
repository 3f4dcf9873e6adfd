//! Tenant Id Resolution
//!
//! Strategies for extracting the tenant identifier from an inbound request.
//! Resolvers only produce the identifier; [`TenantScope`](crate::scope::TenantScope)
//! looks it up in the tenant registry.

use crate::error::{Result, RouterError};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;

/// Default header carrying the tenant id.
pub const DEFAULT_TENANT_HEADER: &str = "x-tenant-id";

/// The parts of an inbound request a resolver may look at.
///
/// Header names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl RequestParts {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// Tenant id resolver trait
///
/// Implement this to extract the tenant id from your request type.
#[async_trait]
pub trait TenantIdResolver: Send + Sync {
    /// Resolve the tenant identifier, or fail with `TenantIdResolve`.
    async fn resolve(&self, request: &RequestParts) -> Result<String>;
}

/// Header-based resolver
///
/// Reads the tenant id from a request header (by default `x-tenant-id`).
pub struct HeaderTenantIdResolver {
    header_name: String,
}

impl HeaderTenantIdResolver {
    /// # Examples
    ///
    /// ```
    /// use tenant_router_core::resolver::HeaderTenantIdResolver;
    ///
    /// let resolver = HeaderTenantIdResolver::new("X-Tenant-ID");
    /// ```
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
        }
    }
}

impl Default for HeaderTenantIdResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT_HEADER)
    }
}

#[async_trait]
impl TenantIdResolver for HeaderTenantIdResolver {
    async fn resolve(&self, request: &RequestParts) -> Result<String> {
        request
            .header(&self.header_name)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                RouterError::TenantIdResolve(format!("missing header: {}", self.header_name))
            })
    }
}

/// Subdomain-based resolver
///
/// `acme.example.com` with base domain `example.com` resolves to `acme`.
pub struct SubdomainTenantIdResolver {
    base_domain: String,
}

impl SubdomainTenantIdResolver {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
        }
    }

    fn extract_subdomain<'a>(&self, host: &'a str) -> Option<&'a str> {
        // Remove port if present
        let host = host.split(':').next().unwrap_or(host);

        host.strip_suffix(self.base_domain.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
            .filter(|subdomain| !subdomain.is_empty() && !subdomain.contains('.'))
    }
}

#[async_trait]
impl TenantIdResolver for SubdomainTenantIdResolver {
    async fn resolve(&self, request: &RequestParts) -> Result<String> {
        let host = request
            .header("host")
            .ok_or_else(|| RouterError::TenantIdResolve("missing Host header".to_string()))?;

        self.extract_subdomain(host)
            .map(str::to_string)
            .ok_or_else(|| RouterError::TenantIdResolve(format!("no subdomain in: {}", host)))
    }
}

/// Path-based resolver
///
/// Captures the tenant id from the request path, e.g. `/tenants/acme/users`.
pub struct PathTenantIdResolver {
    pattern: Regex,
    group_index: usize,
}

impl PathTenantIdResolver {
    /// # Examples
    ///
    /// ```
    /// use tenant_router_core::resolver::PathTenantIdResolver;
    ///
    /// let resolver = PathTenantIdResolver::new(r"^/tenants/([^/]+)", 1).unwrap();
    /// ```
    pub fn new(pattern: &str, group_index: usize) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            group_index,
        })
    }
}

#[async_trait]
impl TenantIdResolver for PathTenantIdResolver {
    async fn resolve(&self, request: &RequestParts) -> Result<String> {
        let captures = self.pattern.captures(&request.path).ok_or_else(|| {
            RouterError::TenantIdResolve(format!("path {} does not match", request.path))
        })?;

        captures
            .get(self.group_index)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| RouterError::TenantIdResolve("capture group not found".to_string()))
    }
}
