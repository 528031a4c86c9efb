// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The production [`ProjectSource`](crate::scheduler::ProjectSource):
//! resolves a `project_id` against the external project catalog over
//! HTTP (spec.md §3: the catalog is owned by the external Web API, not
//! this control plane).

use serde::Deserialize;

use crate::scheduler::{ProjectArtifact, ProjectSource};

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    project_type: String,
    entry_point: String,
    download_url: String,
    expected_file_hash: String,
}

pub struct HttpProjectSource {
    http: reqwest::Client,
    catalog_url: String,
}

impl HttpProjectSource {
    pub fn new(catalog_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            catalog_url: catalog_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl ProjectSource for HttpProjectSource {
    async fn resolve(&self, project_id: &str) -> Result<ProjectArtifact, String> {
        let url = format!("{}/projects/{project_id}/artifact", self.catalog_url);
        let resp = self.http.get(&url).send().await.map_err(|e| e.to_string())?;
        let entry = resp
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json::<CatalogEntry>()
            .await
            .map_err(|e| e.to_string())?;
        Ok(ProjectArtifact {
            project_type: entry.project_type,
            entry_point: entry.entry_point,
            download_url: entry.download_url,
            expected_file_hash: entry.expected_file_hash,
        })
    }
}
