//! API client module
//!
//! This module provides HTTP client functionality to interact with the superobjective API server.

use std::sync::Arc;

use reqwest::{Client as ReqwestClient, Error as ReqwestError, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::completion::TurnType;
use crate::library::{ConflictPolicy, ImportReport, PromptSetExport, TaskExport, TemplateExport};
use crate::models::{PlanResponse, Settings, SettingsUpdate, TaskId, TaskNode, TaskTree};
use crate::runtime::{StatsView, TurnReport};

/// API client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
        }
    }
}

/// Generic API response structure
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] ReqwestError),

    #[error("API error: {0}")]
    Api(String),

    #[error("Missing data in response")]
    MissingData,
}

/// API client for the superobjective service
#[derive(Debug, Clone)]
pub struct Client {
    http_client: Arc<ReqwestClient>,
    config: ClientConfig,
}

impl Client {
    /// Create a new client with default configuration
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a new client with custom configuration
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            http_client: Arc::new(ReqwestClient::new()),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn conversation_url(&self, conversation: &str, path: &str) -> String {
        self.url(&format!("/api/conversations/{}{}", conversation, path))
    }

    // Sends the request and unwraps the `ApiResponse` envelope
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        let api_response: ApiResponse<T> = response.json().await?;

        if api_response.success {
            api_response.data.ok_or(ClientError::MissingData)
        } else {
            Err(ClientError::Api(
                api_response
                    .error
                    .unwrap_or_else(|| "Unknown API error".to_string()),
            ))
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> Result<T, ClientError> {
        self.send(self.http_client.get(url)).await
    }

    async fn post<T: DeserializeOwned>(&self, url: String) -> Result<T, ClientError> {
        self.send(self.http_client.post(url)).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T, ClientError> {
        self.send(self.http_client.post(url).json(body)).await
    }

    /// Get the full task tree
    pub async fn get_plan(&self, conversation: &str) -> Result<PlanResponse<TaskTree>, ClientError> {
        self.get(self.conversation_url(conversation, "/plan")).await
    }

    pub async fn distilled_context(
        &self,
        conversation: &str,
    ) -> Result<PlanResponse<()>, ClientError> {
        self.get(self.conversation_url(conversation, "/distilled"))
            .await
    }

    pub async fn statistics(
        &self,
        conversation: &str,
    ) -> Result<PlanResponse<StatsView>, ClientError> {
        self.get(self.conversation_url(conversation, "/stats")).await
    }

    /// Add a new task; `parent` defaults to the current objective
    pub async fn add_task(
        &self,
        conversation: &str,
        parent: Option<TaskId>,
        description: String,
        index: Option<usize>,
    ) -> Result<PlanResponse<TaskId>, ClientError> {
        #[derive(Serialize)]
        struct AddTaskRequest {
            parent: Option<TaskId>,
            description: String,
            index: Option<usize>,
        }

        let request = AddTaskRequest {
            parent,
            description,
            index,
        };
        self.post_json(self.conversation_url(conversation, "/tasks"), &request)
            .await
    }

    pub async fn remove_task(
        &self,
        conversation: &str,
        id: TaskId,
        confirm: bool,
    ) -> Result<PlanResponse<TaskNode>, ClientError> {
        let url = self.conversation_url(conversation, &format!("/tasks/{}", id));
        self.send(self.http_client.delete(url).query(&[("confirm", confirm)]))
            .await
    }

    pub async fn set_completed(
        &self,
        conversation: &str,
        id: TaskId,
        completed: bool,
    ) -> Result<PlanResponse<bool>, ClientError> {
        let action = if completed { "complete" } else { "uncomplete" };
        self.post(self.conversation_url(conversation, &format!("/tasks/{}/{}", id, action)))
            .await
    }

    /// Complete the active task without asking the generation service
    pub async fn complete_active(
        &self,
        conversation: &str,
    ) -> Result<PlanResponse<bool>, ClientError> {
        self.post(self.conversation_url(conversation, "/active/complete"))
            .await
    }

    /// Runs a completion check now; the server answers with plain `true` or `false`
    pub async fn check_now(&self, conversation: &str) -> Result<bool, ClientError> {
        let url = self.conversation_url(conversation, "/check");
        let response = self.http_client.post(&url).send().await?;

        if !response.status().is_success() {
            let api_response: ApiResponse<()> = response.json().await?;
            return Err(ClientError::Api(
                api_response
                    .error
                    .unwrap_or_else(|| "Unknown API error".to_string()),
            ));
        }

        let text = response.text().await?;
        Ok(text.trim() == "true")
    }

    pub async fn generate(
        &self,
        conversation: &str,
        additional: bool,
    ) -> Result<PlanResponse<Vec<TaskId>>, ClientError> {
        let path = if additional {
            "/generate-more"
        } else {
            "/generate"
        };
        self.post(self.conversation_url(conversation, path)).await
    }

    pub async fn set_objective(
        &self,
        conversation: &str,
        description: String,
    ) -> Result<PlanResponse<()>, ClientError> {
        let url = self.conversation_url(conversation, "/objective");
        self.send(
            self.http_client
                .put(url)
                .json(&serde_json::json!({ "description": description })),
        )
        .await
    }

    pub async fn branch(
        &self,
        conversation: &str,
        id: TaskId,
    ) -> Result<PlanResponse<()>, ClientError> {
        self.post(self.conversation_url(conversation, &format!("/tasks/{}/branch", id)))
            .await
    }

    pub async fn ascend(&self, conversation: &str) -> Result<PlanResponse<bool>, ClientError> {
        self.post(self.conversation_url(conversation, "/ascend"))
            .await
    }

    /// Report a received message
    pub async fn turn(
        &self,
        conversation: &str,
        turn_type: TurnType,
    ) -> Result<PlanResponse<TurnReport>, ClientError> {
        self.post_json(
            self.conversation_url(conversation, "/turn"),
            &serde_json::json!({ "turn_type": turn_type }),
        )
        .await
    }

    pub async fn swipe(&self, conversation: &str) -> Result<PlanResponse<()>, ClientError> {
        self.post(self.conversation_url(conversation, "/swipe"))
            .await
    }

    pub async fn switch_conversation(
        &self,
        conversation: &str,
    ) -> Result<PlanResponse<()>, ClientError> {
        self.post(self.conversation_url(conversation, "/switch"))
            .await
    }

    pub async fn update_settings(
        &self,
        conversation: &str,
        update: &SettingsUpdate,
    ) -> Result<PlanResponse<Settings>, ClientError> {
        let url = self.conversation_url(conversation, "/settings");
        self.send(self.http_client.put(url).json(update)).await
    }

    pub async fn export_tasks(&self, conversation: &str) -> Result<TaskExport, ClientError> {
        self.get(self.conversation_url(conversation, "/export"))
            .await
    }

    pub async fn import_tasks(
        &self,
        conversation: &str,
        document: &Value,
        confirm: bool,
    ) -> Result<PlanResponse<Vec<TaskId>>, ClientError> {
        let url = self.conversation_url(conversation, "/import");
        self.send(
            self.http_client
                .post(url)
                .query(&[("confirm", confirm)])
                .json(document),
        )
        .await
    }

    pub async fn template_names(&self) -> Result<Vec<String>, ClientError> {
        self.get(self.url("/api/library/templates")).await
    }

    pub async fn save_template(
        &self,
        conversation: &str,
        name: &str,
    ) -> Result<PlanResponse<()>, ClientError> {
        self.post(self.conversation_url(conversation, &format!("/templates/{}", name)))
            .await
    }

    pub async fn load_template(
        &self,
        conversation: &str,
        name: &str,
        confirm: bool,
    ) -> Result<PlanResponse<Vec<TaskId>>, ClientError> {
        let url = self.conversation_url(conversation, &format!("/templates/{}/load", name));
        self.send(self.http_client.post(url).query(&[("confirm", confirm)]))
            .await
    }

    /// Returns the deleted template's name
    pub async fn delete_template(&self, name: &str, confirm: bool) -> Result<String, ClientError> {
        let url = self.url(&format!("/api/library/templates/{}", name));
        self.send(self.http_client.delete(url).query(&[("confirm", confirm)]))
            .await
    }

    pub async fn export_templates(&self, names: &[String]) -> Result<TemplateExport, ClientError> {
        let url = self.url("/api/library/export/templates");
        self.send(self.http_client.get(url).query(&[("names", names.join(","))]))
            .await
    }

    pub async fn import_templates(
        &self,
        document: &Value,
        policy: ConflictPolicy,
    ) -> Result<ImportReport, ClientError> {
        let url = self.url("/api/library/import/templates");
        self.send(
            self.http_client
                .post(url)
                .query(&[("policy", policy.to_string())])
                .json(document),
        )
        .await
    }

    pub async fn prompt_set_names(&self) -> Result<Vec<String>, ClientError> {
        self.get(self.url("/api/library/prompt-sets")).await
    }

    pub async fn select_prompt_set(
        &self,
        conversation: &str,
        name: &str,
    ) -> Result<PlanResponse<()>, ClientError> {
        self.post(self.conversation_url(conversation, &format!("/prompt-sets/{}/select", name)))
            .await
    }

    pub async fn new_prompt_set(
        &self,
        conversation: &str,
        name: &str,
    ) -> Result<PlanResponse<()>, ClientError> {
        self.post(self.conversation_url(conversation, &format!("/prompt-sets/{}", name)))
            .await
    }

    pub async fn save_prompt_set(&self, conversation: &str) -> Result<PlanResponse<()>, ClientError> {
        let url = self.conversation_url(conversation, "/prompt-set");
        self.send(self.http_client.put(url)).await
    }

    pub async fn delete_prompt_set(
        &self,
        conversation: &str,
        confirm: bool,
    ) -> Result<PlanResponse<()>, ClientError> {
        let url = self.conversation_url(conversation, "/prompt-set");
        self.send(self.http_client.delete(url).query(&[("confirm", confirm)]))
            .await
    }

    pub async fn export_prompt_sets(
        &self,
        names: &[String],
    ) -> Result<PromptSetExport, ClientError> {
        let url = self.url("/api/library/export/prompt-sets");
        self.send(self.http_client.get(url).query(&[("names", names.join(","))]))
            .await
    }

    pub async fn import_prompt_sets(
        &self,
        document: &Value,
        policy: ConflictPolicy,
    ) -> Result<ImportReport, ClientError> {
        let url = self.url("/api/library/import/prompt-sets");
        self.send(
            self.http_client
                .post(url)
                .query(&[("policy", policy.to_string())])
                .json(document),
        )
        .await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
