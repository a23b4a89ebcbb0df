use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClientError;
use crate::http::{ServiceClient, ServiceConfig, json};

/// Task service: asynchronous tasks and task lists started from policies.
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(&self, name: &str, input: Value) -> Result<Value, ClientError>;

    async fn create_task_list(&self, name: &str, input: Value) -> Result<Value, ClientError>;
}

#[derive(Debug, Clone)]
pub struct TaskClient {
    service: ServiceClient,
}

impl TaskClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, ClientError> {
        Ok(Self {
            service: ServiceClient::new(config)?,
        })
    }

    async fn post(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        let response = self
            .service
            .http()
            .post(self.service.url(path)?)
            .json(&input)
            .send()
            .await?;
        json(response).await
    }
}

#[async_trait]
impl TaskService for TaskClient {
    async fn create_task(&self, name: &str, input: Value) -> Result<Value, ClientError> {
        self.post(&format!("v1/task/{name}"), input).await
    }

    async fn create_task_list(&self, name: &str, input: Value) -> Result<Value, ClientError> {
        self.post(&format!("v1/taskList/{name}"), input).await
    }
}
