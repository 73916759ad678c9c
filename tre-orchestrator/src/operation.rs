use crate::error::{OrchestratorError, Result};
use crate::resource::{Properties, Resource, ResourceStatus, ResourceType};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    Install,
    Upgrade,
    Uninstall,
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationAction::Install => "install",
            OperationAction::Upgrade => "upgrade",
            OperationAction::Uninstall => "uninstall",
        })
    }
}

/// Request for the deployment system to act on a persisted resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMessage {
    pub operation_id: Uuid,
    pub resource_id: Uuid,
    pub resource_type: ResourceType,
    pub action: OperationAction,
    pub template_name: String,
    pub template_version: String,
    pub properties: Properties,
    pub resource_version: u64,
}

impl OperationMessage {
    pub fn for_resource(resource: &Resource, action: OperationAction) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            resource_id: resource.id,
            resource_type: resource.resource_type,
            action,
            template_name: resource.template_name.clone(),
            template_version: resource.template_version.clone(),
            properties: resource.properties.clone(),
            resource_version: resource.resource_version,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Status report from the deployment system for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeploymentStatusEvent {
    /// Id of the resource the report is about
    pub id: Uuid,
    #[serde(default)]
    pub operation_id: Option<Uuid>,
    pub status: ResourceStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub outputs: Option<Properties>,
}

/// Decode a JSON message body, reporting any shape problem as malformed
pub fn decode_event<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| OrchestratorError::MalformedMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_message_shape() {
        let message = OperationMessage {
            operation_id: Uuid::nil(),
            resource_id: Uuid::nil(),
            resource_type: ResourceType::WorkspaceService,
            action: OperationAction::Install,
            template_name: "t1".to_string(),
            template_version: "1.0".to_string(),
            properties: Properties::new(),
            resource_version: 0,
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["action"], json!("install"));
        assert_eq!(value["resourceType"], json!("workspace-service"));
        assert_eq!(value["templateVersion"], json!("1.0"));
        assert!(value.get("operationId").is_some());
    }

    #[test]
    fn test_decode_status_event() {
        let id = Uuid::new_v4();
        let body = json!({"id": id, "status": "deployed", "outputs": {"url": "x"}}).to_string();

        let event: DeploymentStatusEvent = decode_event(&body).unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.status, ResourceStatus::Deployed);
        assert_eq!(event.outputs.unwrap()["url"], json!("x"));
        assert!(event.message.is_none());
    }

    #[test]
    fn test_malformed_status_events() {
        let id = Uuid::new_v4();
        let bodies = [
            "not json".to_string(),
            json!({"id": id}).to_string(),
            json!({"id": "not-a-uuid", "status": "deployed"}).to_string(),
            json!({"id": id, "status": "exploded"}).to_string(),
            json!({"id": id, "status": "deployed", "extra": 1}).to_string(),
        ];

        for body in bodies {
            let err = decode_event::<DeploymentStatusEvent>(&body).unwrap_err();
            assert!(matches!(err, OrchestratorError::MalformedMessage(_)), "{body}");
        }
    }
}
