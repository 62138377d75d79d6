use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Spec of the Multus NetworkAttachmentDefinition custom resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "NetworkAttachmentDefinition",
    group = "k8s.cni.cncf.io",
    version = "v1",
    plural = "network-attachment-definitions",
    doc = "Secondary network interface configuration consumed by the Multus CNI plugin",
    namespaced
)]
pub struct NetworkAttachmentDefinitionSpec {
    /// CNI configuration, carried as a JSON string.
    pub config: String,
}

/// One entry of the `k8s.v1.cni.cncf.io/networks` annotation.
///
/// This is an external wire format read by Multus: field names, array order
/// and the omission of absent optional fields must stay byte-compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAnnotation {
    pub name: String,
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// One secondary network interface the workload should come up with: the
/// annotation entry plus the NetworkAttachmentDefinition it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAttachmentRequest {
    /// NetworkAttachmentDefinition name, referenced by the annotation entry.
    pub name: String,

    /// Interface name inside the pod.
    pub interface: String,

    /// Static IPs handed to the CNI IPAM plugin, if any.
    #[serde(default)]
    pub ips: Option<Vec<String>>,

    /// Fixed MAC address, if any.
    #[serde(default)]
    pub mac: Option<String>,

    /// CNI configuration for the definition, as a JSON string.
    pub config: String,
}

impl NetworkAttachmentRequest {
    pub fn annotation(&self) -> NetworkAnnotation {
        NetworkAnnotation {
            name: self.name.clone(),
            interface: self.interface.clone(),
            ips: self.ips.clone(),
            mac: self.mac.clone(),
        }
    }

    /// The definition to create, labelled with the owning workload so that
    /// externally-managed definitions of the same name are left untouched.
    pub fn definition(&self, owner_label: &str, workload: &str) -> NetworkAttachmentDefinition {
        let mut definition = NetworkAttachmentDefinition::new(
            &self.name,
            NetworkAttachmentDefinitionSpec {
                config: self.config.clone(),
            },
        );
        definition.metadata.labels = Some(BTreeMap::from([(
            owner_label.to_string(),
            workload.to_string(),
        )]));
        definition
    }
}

/// Annotation entries for a request set, in request order.
pub fn annotations_for(requested: &[NetworkAttachmentRequest]) -> Vec<NetworkAnnotation> {
    requested.iter().map(NetworkAttachmentRequest::annotation).collect()
}

/// Encode annotation entries into the Multus annotation value.
pub fn encode_annotations(annotations: &[NetworkAnnotation]) -> Result<String> {
    serde_json::to_string(annotations).map_err(Error::SerializationError)
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;

    fn requests() -> Vec<NetworkAttachmentRequest> {
        vec![
            NetworkAttachmentRequest {
                name: "access-net".into(),
                interface: "access".into(),
                ips: Some(vec!["192.0.2.10/24".into()]),
                mac: None,
                config: r#"{"cniVersion":"0.3.1","type":"macvlan"}"#.into(),
            },
            NetworkAttachmentRequest {
                name: "core-net".into(),
                interface: "core".into(),
                ips: None,
                mac: Some("02:00:00:00:00:01".into()),
                config: r#"{"cniVersion":"0.3.1","type":"bridge"}"#.into(),
            },
        ]
    }

    #[test]
    fn annotation_wire_format_matches_multus_schema() {
        let encoded = encode_annotations(&annotations_for(&requests())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_json_eq!(
            value,
            json!([
                { "name": "access-net", "interface": "access", "ips": ["192.0.2.10/24"] },
                { "name": "core-net", "interface": "core", "mac": "02:00:00:00:00:01" },
            ])
        );
    }

    #[test]
    fn annotations_round_trip_preserving_order() {
        let annotations = annotations_for(&requests());
        let encoded = encode_annotations(&annotations).unwrap();
        let decoded: Vec<NetworkAnnotation> = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, annotations);
    }

    #[test]
    fn definition_carries_the_owner_label() {
        let definition = requests()[0].definition("app.example.com/owner", "my-app");

        assert_eq!(
            definition.metadata.labels.unwrap()["app.example.com/owner"],
            "my-app"
        );
        assert_eq!(definition.metadata.name.as_deref(), Some("access-net"));
    }
}
