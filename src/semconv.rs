//! OpenTelemetry semantic-convention attributes derived from flow records.

use crate::record::{lookup, lookup_int, lookup_str, lookup_strings, FieldValue, Record};
use crate::value::{string_attributes, AnyValue, KeyValue};

pub const ATTR_HTTP_METHOD: &str = "http.method";
pub const ATTR_HTTP_URL: &str = "http.url";
pub const ATTR_HTTP_FLAVOR: &str = "http.flavor";
pub const ATTR_HTTP_HOST: &str = "http.host";
pub const ATTR_HTTP_USER_AGENT: &str = "http.user_agent";
pub const ATTR_HTTP_STATUS_CODE: &str = "http.status_code";
pub const ATTR_HTTP_REQUEST_HEADER: &str = "http.request.header.";
pub const ATTR_HTTP_RESPONSE_HEADER: &str = "http.response.header.";

pub const ATTR_K8S_NODE_NAME: &str = "k8s.node.name";
pub const ATTR_K8S_NAMESPACE_NAME: &str = "k8s.namespace.name";
pub const ATTR_K8S_POD_NAME: &str = "k8s.pod.name";

pub const ATTR_SERVICE_NAME: &str = "service.name";
pub const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";

pub const DEFAULT_SERVICE_NAME_PREFIX: &str = "hubble-otel-unknown";

/// Lower-case a header name and replace `-` with `_`.
pub fn normalise_header_key(key: &str) -> String {
    key.to_lowercase().replace('-', "_")
}

fn http_flavor(protocol: &str) -> Option<&'static str> {
    match protocol {
        "HTTP/1.0" => Some("1.0"),
        "HTTP/1.1" => Some("1.1"),
        "HTTP/2.0" => Some("2.0"),
        "SPDY" => Some("SPDY"),
        "QUIC" => Some("QUIC"),
        _ => None,
    }
}

pub(crate) fn http_headers(record: &dyn Record) -> Vec<(String, String)> {
    lookup(record, "l7.http.headers", |field| match field.value() {
        FieldValue::RecordList(items) => items
            .iter()
            .filter_map(|item| {
                let key = lookup_str(item.as_ref(), "key")?;
                Some((key, lookup_str(item.as_ref(), "value").unwrap_or_default()))
            })
            .collect(),
        _ => Vec::new(),
    })
    .unwrap_or_default()
}

/// HTTP attributes of an L7 flow; empty when the record carries no HTTP data.
///
/// `Host` and `User-Agent` headers become their dedicated attributes, other
/// headers are grouped per normalised name in first-seen order.
pub fn http_attributes(record: &dyn Record) -> Vec<KeyValue> {
    if lookup(record, "l7.http", |_| ()).is_none() {
        return Vec::new();
    }

    let mut attributes = string_attributes([
        (
            ATTR_HTTP_METHOD,
            lookup_str(record, "l7.http.method").unwrap_or_default(),
        ),
        (
            ATTR_HTTP_URL,
            lookup_str(record, "l7.http.url").unwrap_or_default(),
        ),
    ]);

    if let Some(flavor) = lookup_str(record, "l7.http.protocol")
        .as_deref()
        .and_then(http_flavor)
    {
        attributes.push(KeyValue::new(ATTR_HTTP_FLAVOR, flavor.into()));
    }

    let header_prefix = match lookup_str(record, "l7.type").as_deref() {
        Some("REQUEST") => Some(ATTR_HTTP_REQUEST_HEADER),
        Some("RESPONSE") => Some(ATTR_HTTP_RESPONSE_HEADER),
        _ => None,
    };

    let mut headers: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in http_headers(record) {
        let key = normalise_header_key(&key);
        let designated = match key.as_str() {
            "host" => Some(ATTR_HTTP_HOST),
            "user_agent" => Some(ATTR_HTTP_USER_AGENT),
            _ => None,
        };
        if let Some(attr) = designated {
            // a repeated header overwrites the earlier value
            match attributes.iter_mut().find(|kv| kv.key == attr) {
                Some(kv) => kv.value = value.into(),
                None => attributes.push(KeyValue::new(attr, value.into())),
            }
            continue;
        }

        let Some(prefix) = header_prefix else {
            continue;
        };
        let name = format!("{}{}", prefix, key);
        match headers.iter_mut().find(|(k, _)| *k == name) {
            Some((_, values)) => values.push(value),
            None => headers.push((name, vec![value])),
        }
    }

    if let Some(code) = lookup_int(record, "l7.http.code").filter(|c| *c != 0) {
        attributes.push(KeyValue::new(ATTR_HTTP_STATUS_CODE, AnyValue::Int(code)));
    }

    attributes.extend(
        headers
            .into_iter()
            .map(|(key, values)| KeyValue::new(key, AnyValue::string_array(values))),
    );
    attributes
}

pub fn kubernetes_attributes(record: &dyn Record) -> Vec<KeyValue> {
    let mut attributes = string_attributes([(
        ATTR_K8S_NODE_NAME,
        lookup_str(record, "node_name").unwrap_or_default(),
    )]);

    if let Some(namespace) = lookup_str(record, "source.namespace").filter(|s| !s.is_empty()) {
        attributes.push(KeyValue::new(ATTR_K8S_NAMESPACE_NAME, namespace.into()));
    }
    if let Some(pod) = lookup_str(record, "source.pod_name").filter(|s| !s.is_empty()) {
        attributes.push(KeyValue::new(ATTR_K8S_POD_NAME, pod.into()));
    }
    attributes
}

/// What the source endpoint's identity labels say about it.
#[derive(Debug, Default, PartialEq, Eq)]
struct LabelProps {
    app_name: Option<String>,
    is_host: bool,
    is_init: bool,
    is_kube_dns: bool,
    is_prometheus: bool,
    is_remote_node: bool,
    is_world: bool,
}

impl LabelProps {
    fn from_labels(labels: &[String]) -> Self {
        let mut props = LabelProps::default();
        for label in labels {
            let (key, value) = label.split_once('=').unwrap_or((label.as_str(), ""));
            match key {
                "k8s:app.kubernetes.io/name" | "k8s:app" | "k8s:k8s-app"
                    if props.app_name.is_none() && !value.is_empty() =>
                {
                    props.app_name = Some(value.to_string());
                }
                _ => {}
            }
            match (key, value) {
                ("reserved:host", _) => props.is_host = true,
                ("reserved:init", _) => props.is_init = true,
                ("reserved:remote-node", _) => props.is_remote_node = true,
                ("reserved:world", _) => props.is_world = true,
                ("k8s:k8s-app", "kube-dns") => props.is_kube_dns = true,
                ("k8s:app", "prometheus") => props.is_prometheus = true,
                _ => {}
            }
        }
        props
    }
}

fn service_name_from_url(record: &dyn Record) -> Option<String> {
    let url = lookup_str(record, "l7.http.url")?;
    let parsed = reqwest::Url::parse(&url).ok()?;
    parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

/// `service.name` (and `service.namespace` when known) for the flow's source.
pub fn service_attributes(record: &dyn Record, fallback_prefix: &str) -> Vec<KeyValue> {
    let fallback = |suffix: &str| format!("{}-{}", fallback_prefix, suffix);
    let mut service_name = fallback("any");
    let mut service_namespace = None;

    if lookup(record, "source", |_| ()).is_some() {
        let props = LabelProps::from_labels(&lookup_strings(record, "source.labels"));
        if let Some(app_name) = props.app_name {
            service_name = app_name;
            service_namespace = Some(lookup_str(record, "source.namespace").unwrap_or_default());
        } else if props.is_host {
            service_name = fallback("host");
        } else if props.is_init {
            service_name = fallback("init");
        } else if props.is_kube_dns {
            service_name = fallback("kube-dns");
        } else if props.is_prometheus {
            service_name = fallback("prometheus");
        } else if props.is_remote_node {
            service_name = fallback("remote-node");
        } else if props.is_world {
            // the pod may be known while the effective source is the world
            service_name = service_name_from_url(record).unwrap_or_else(|| fallback("world"));
        }
    }

    let mut attributes = string_attributes([(ATTR_SERVICE_NAME, service_name)]);
    if let Some(namespace) = service_namespace {
        attributes.push(KeyValue::new(ATTR_SERVICE_NAMESPACE, namespace.into()));
    }
    attributes
}

/// Resource attributes: service first, then Kubernetes.
pub fn resource_attributes(record: &dyn Record, fallback_prefix: &str) -> Vec<KeyValue> {
    let mut attributes = service_attributes(record, fallback_prefix);
    attributes.extend(kubernetes_attributes(record));
    attributes
}
