//! The managed on-disk layout of the stack and the defaults written into it.

use crate::config::Config;
use crate::reconcile::ConfigArtifact;
use std::path::{Path, PathBuf};

const MOSQUITTO_CONF: &str = r#"persistence true
persistence_location /mosquitto/data/
log_dest file /mosquitto/log/mosquitto.log

listener 1883
allow_anonymous true
"#;

const INFLUXDB_WRAPPER: &str = r#"#!/bin/sh
# A setup interrupted before influxd.bolt was written leaves influx-configs
# behind, and the stock entrypoint then retries setup forever.
set -e
if [ ! -f /var/lib/influxdb2/influxd.bolt ]; then
    rm -f /etc/influxdb2/influx-configs
fi
exec /entrypoint.sh "$@"
"#;

const HA_CONFIGURATION: &str = r#"# Loads default set of integrations. Do not remove.
default_config:

frontend:
  themes: !include_dir_merge_named themes

automation: !include automations.yaml
script: !include scripts.yaml
scene: !include scenes.yaml
"#;

const HA_HTTP_BLOCK: &str = r#"http:
  use_x_forwarded_for: true
  trusted_proxies:
    - 172.16.0.0/12
    - 127.0.0.1
"#;

const HA_SECRETS: &str = "# Host-local secrets referenced with !secret. Keep out of version control.\n";

const HA_DASHBOARD: &str = r#"title: Home
views:
  - title: Overview
    path: overview
    cards:
      - type: markdown
        content: >
          This dashboard is a placeholder. Edit it from the UI or replace
          ui-lovelace.yaml.
"#;

const NGINX_VHOST: &str = r#"server {
    listen 80;
    server_name _;
    root /var/www/html/public;
    index index.php index.html;

    location / {
        try_files $uri $uri/ /index.php?$query_string;
    }

    location ~ \.php$ {
        fastcgi_pass web:9000;
        fastcgi_index index.php;
        include fastcgi_params;
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
    }
}
"#;

const WEB_DOCKERFILE: &str = r#"FROM php:8.3-fpm
RUN apt-get update \
    && apt-get install -y --no-install-recommends git unzip libzip-dev \
    && docker-php-ext-install pdo_mysql zip \
    && rm -rf /var/lib/apt/lists/*
COPY --from=composer:2 /usr/bin/composer /usr/bin/composer
WORKDIR /var/www/html
"#;

/// Resolved locations the later phases need.
#[derive(Debug, Clone)]
pub struct StackPaths {
    pub root: PathBuf,
    pub env_file: PathBuf,
    pub compose_file: PathBuf,
    pub store_marker: PathBuf,
    pub automation_config: PathBuf,
    pub automation_secrets: PathBuf,
    pub web_marker: PathBuf,
}

impl StackPaths {
    pub fn new(root: &Path, cfg: &Config) -> Self {
        let ha_dir = root.join(&cfg.homeassistant.config_dir);
        Self {
            root: root.to_path_buf(),
            env_file: root.join(&cfg.project.env_file),
            compose_file: root.join(&cfg.project.compose_file),
            store_marker: root.join(&cfg.influxdb.marker),
            automation_config: ha_dir.join("configuration.yaml"),
            automation_secrets: ha_dir.join("secrets.yaml"),
            web_marker: root.join(&cfg.web.init_marker),
        }
    }
}

pub fn stack_artifacts(cfg: &Config) -> Vec<ConfigArtifact> {
    let ha = cfg.homeassistant.config_dir.trim_end_matches('/');
    let ha_file = |name: &str| format!("{ha}/{name}");
    vec![
        ConfigArtifact::required_companion(&cfg.project.compose_file, &cfg.project.compose_file),
        ConfigArtifact::dir("mosquitto/config"),
        ConfigArtifact::dir("mosquitto/data"),
        ConfigArtifact::dir("mosquitto/log"),
        ConfigArtifact::file("mosquitto/config/mosquitto.conf", MOSQUITTO_CONF)
            .with_companion("mosquitto.conf"),
        ConfigArtifact::dir("influxdb/data"),
        ConfigArtifact::dir("influxdb/config"),
        ConfigArtifact::file("influxdb/entrypoint-wrapper.sh", INFLUXDB_WRAPPER)
            .with_companion("influxdb-entrypoint.sh")
            .with_mode(0o755),
        ConfigArtifact::dir(ha),
        ConfigArtifact::file(&ha_file("configuration.yaml"), HA_CONFIGURATION)
            .with_companion("configuration.yaml"),
        ConfigArtifact::block(&ha_file("configuration.yaml"), "http", HA_HTTP_BLOCK),
        ConfigArtifact::file(&ha_file("secrets.yaml"), HA_SECRETS).with_mode(0o600),
        ConfigArtifact::file(&ha_file("automations.yaml"), "[]\n"),
        ConfigArtifact::file(&ha_file("scripts.yaml"), ""),
        ConfigArtifact::file(&ha_file("scenes.yaml"), ""),
        ConfigArtifact::dir(&ha_file("themes")),
        ConfigArtifact::file(&ha_file("ui-lovelace.yaml"), HA_DASHBOARD),
        ConfigArtifact::dir("nodered/data"),
        ConfigArtifact::dir("web/app"),
        ConfigArtifact::dir("web/nginx"),
        ConfigArtifact::file("web/nginx/default.conf", NGINX_VHOST).with_companion("nginx.conf"),
        ConfigArtifact::file("web/Dockerfile", WEB_DOCKERFILE).with_companion("Dockerfile"),
    ]
}
