//! Generates Traefik-shaped container labels. Pure functions, no I/O, no
//! dependency on any particular reverse proxy being reachable from this
//! process — the labels are inert data consumed by an external Traefik
//! instance watching the same Docker/Podman socket.

use std::collections::HashMap;

use crate::config::EdgeRouterConfig;
use crate::naming::sanitize_router_name;

/// Builds the label set for one service container of a preview.
pub fn generate_labels(
    preview_id: &str,
    repo_owner: &str,
    service_name: &str,
    port: u16,
    password: Option<&str>,
    config: &EdgeRouterConfig,
) -> HashMap<String, String> {
    let router = sanitize_router_name(&format!("{preview_id}-{service_name}"));
    let external_host = crate::naming::external_host(preview_id, repo_owner, service_name, &config.base_domain);

    let mut labels = HashMap::new();
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(
        format!("traefik.http.routers.{router}.rule"),
        format!("Host(`{external_host}`)"),
    );
    labels.insert(
        format!("traefik.http.routers.{router}.entrypoints"),
        "websecure".to_string(),
    );
    labels.insert(
        format!("traefik.http.services.{router}.loadbalancer.server.port"),
        port.to_string(),
    );

    labels.insert("managed".to_string(), "true".to_string());
    labels.insert("preview".to_string(), preview_id.to_string());
    labels.insert("service".to_string(), service_name.to_string());
    labels.insert("owner".to_string(), repo_owner.to_string());

    if config.tls_enabled {
        labels.insert(format!("traefik.http.routers.{router}.tls"), "true".to_string());
        labels.insert(
            format!("traefik.http.routers.{router}.tls.certresolver"),
            config.cert_resolver.clone(),
        );
    }

    let effective_password = password
        .map(str::to_string)
        .or_else(|| {
            if config.password_protect_default {
                config.fallback_password.clone()
            } else {
                None
            }
        });

    if let Some(pwd) = effective_password {
        if let Ok(hash) = bcrypt::hash(pwd, bcrypt::DEFAULT_COST) {
            labels.insert(
                format!("traefik.http.middlewares.{router}-auth.basicauth.users"),
                format!("preview:{hash}"),
            );
            labels.insert(
                format!("traefik.http.routers.{router}.middlewares"),
                format!("{router}-auth"),
            );
        }
    }

    labels
}

/// External URL a caller would use to reach a service, matching the `Host()`
/// rule produced by [`generate_labels`].
pub fn external_url(preview_id: &str, repo_owner: &str, service_name: &str, config: &EdgeRouterConfig) -> String {
    let host = crate::naming::external_host(preview_id, repo_owner, service_name, &config.base_domain);
    let proto = if config.tls_enabled { "https" } else { "http" };
    format!("{proto}://{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EdgeRouterConfig {
        EdgeRouterConfig {
            network: "previewd-edge".to_string(),
            base_domain: "preview.localhost".to_string(),
            tls_enabled: false,
            cert_resolver: "letsencrypt".to_string(),
            password_protect_default: false,
            fallback_password: None,
        }
    }

    #[test]
    fn generates_core_routing_labels() {
        let labels = generate_labels("pr-42", "acme", "web", 8080, None, &config());
        assert_eq!(labels.get("traefik.enable"), Some(&"true".to_string()));
        assert!(labels
            .values()
            .any(|v| v.starts_with("Host(`pr-42-acme.web.preview.localhost`)")));
        assert_eq!(labels.get("preview"), Some(&"pr-42".to_string()));
        assert_eq!(labels.get("service"), Some(&"web".to_string()));
        assert_eq!(labels.get("owner"), Some(&"acme".to_string()));
        assert_eq!(labels.get("managed"), Some(&"true".to_string()));
    }

    #[test]
    fn omits_tls_labels_when_disabled() {
        let labels = generate_labels("pr-1", "acme", "web", 8080, None, &config());
        assert!(!labels.keys().any(|k| k.contains(".tls")));
    }

    #[test]
    fn adds_tls_labels_when_enabled() {
        let mut cfg = config();
        cfg.tls_enabled = true;
        let labels = generate_labels("pr-1", "acme", "web", 8080, None, &cfg);
        assert!(labels.keys().any(|k| k.ends_with(".tls")));
        assert!(labels.keys().any(|k| k.ends_with(".tls.certresolver")));
    }

    #[test]
    fn adds_basicauth_when_password_set() {
        let labels = generate_labels("pr-1", "acme", "web", 8080, Some("s3cret"), &config());
        assert!(labels.keys().any(|k| k.ends_with("-auth.basicauth.users")));
        assert!(labels.keys().any(|k| k.ends_with(".middlewares")));
    }

    #[test]
    fn falls_back_to_default_password_when_globally_enabled() {
        let mut cfg = config();
        cfg.password_protect_default = true;
        cfg.fallback_password = Some("globalpass".to_string());
        let labels = generate_labels("pr-1", "acme", "web", 8080, None, &cfg);
        assert!(labels.keys().any(|k| k.ends_with("-auth.basicauth.users")));
    }

    #[test]
    fn external_url_reflects_tls_setting() {
        let url = external_url("pr-1", "acme", "web", &config());
        assert_eq!(url, "http://pr-1-acme.web.preview.localhost");

        let mut cfg = config();
        cfg.tls_enabled = true;
        let url = external_url("pr-1", "acme", "web", &cfg);
        assert_eq!(url, "https://pr-1-acme.web.preview.localhost");
    }
}
