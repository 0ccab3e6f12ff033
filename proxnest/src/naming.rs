//! Theme-based hostname generation for the guest fleet.
//!
//! Pure apart from the random theme pick when no theme is requested.

use rand::seq::IndexedRandom;

/// Server/application themed word lists, 15 entries each.
pub const THEMES: &[(&str, &[&str])] = &[
    (
        "databases",
        &[
            "mongo",
            "postgres",
            "mysql",
            "redis",
            "elastic",
            "cassandra",
            "influx",
            "neo4j",
            "couch",
            "mariadb",
            "sqlite",
            "cockroach",
            "timescale",
            "clickhouse",
            "dynamo",
        ],
    ),
    (
        "webservers",
        &[
            "nginx",
            "apache",
            "caddy",
            "traefik",
            "haproxy",
            "envoy",
            "varnish",
            "lighttpd",
            "tomcat",
            "jetty",
            "gunicorn",
            "uvicorn",
            "puma",
            "passenger",
            "httpd",
        ],
    ),
    (
        "messaging",
        &[
            "kafka",
            "rabbit",
            "nats",
            "pulsar",
            "zeromq",
            "activemq",
            "mosquitto",
            "emqx",
            "redis-mq",
            "nsq",
            "celery",
            "sidekiq",
            "resque",
            "bull",
            "bee",
        ],
    ),
    (
        "monitoring",
        &[
            "prometheus",
            "grafana",
            "datadog",
            "nagios",
            "zabbix",
            "influx",
            "telegraf",
            "jaeger",
            "zipkin",
            "sentry",
            "newrelic",
            "splunk",
            "logstash",
            "kibana",
            "fluentd",
        ],
    ),
    (
        "containers",
        &[
            "docker",
            "podman",
            "containerd",
            "kubernetes",
            "nomad",
            "swarm",
            "rancher",
            "portainer",
            "harbor",
            "registry",
            "buildah",
            "skopeo",
            "crio",
            "runc",
            "lxc",
        ],
    ),
];

/// List the available theme keys.
pub fn theme_names() -> Vec<&'static str> {
    THEMES.iter().map(|(name, _)| *name).collect()
}

/// The first five words of a theme, for UI previews.
pub fn theme_preview(theme: &str) -> Option<&'static [&'static str]> {
    lookup(theme).map(|words| &words[..5.min(words.len())])
}

/// Pick a theme key uniformly at random.
pub fn random_theme() -> &'static str {
    THEMES
        .choose(&mut rand::rng())
        .map(|(name, _)| *name)
        .unwrap_or("databases")
}

fn lookup(theme: &str) -> Option<&'static [&'static str]> {
    THEMES
        .iter()
        .find(|(name, _)| *name == theme)
        .map(|(_, words)| *words)
}

/// Generate `count` themed hostnames.
///
/// An absent or unrecognized theme falls back to a random one. Names are the
/// theme's word list truncated to `count` (no wraparound: asking for more
/// names than the list holds yields fewer), each suffixed with a two-digit,
/// one-based sequence number (`mongo-01`, `mongo-02`, ...).
pub fn generate_names(count: usize, theme: Option<&str>) -> Vec<String> {
    let words = theme
        .and_then(lookup)
        .unwrap_or_else(|| lookup(random_theme()).unwrap_or(&[]));

    words
        .iter()
        .take(count)
        .enumerate()
        .map(|(i, word)| format!("{}-{:02}", word, i + 1))
        .collect()
}
