use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use storyrelay::config::Config;
use storyrelay::request::{CallerIdentity, GenerationRequest};

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Config pointing at `endpoint` with throwaway databases
#[allow(dead_code)]
pub fn test_config(endpoint: &str) -> Config {
    let mut config = Config::default();
    config.provider.endpoint = endpoint.to_string();
    config.storage.temporary = true;
    config
}

/// Provider response body made of the given records
#[allow(dead_code)]
pub fn record_body(records: &[&str]) -> Vec<u8> {
    records
        .iter()
        .map(|r| format!("data: {}\n\n", r))
        .collect::<String>()
        .into_bytes()
}

/// Body streaming `chunks` then the end-of-stream sentinel
#[allow(dead_code)]
pub fn chunk_body(chunks: &[&str]) -> Vec<u8> {
    let mut records: Vec<String> = chunks
        .iter()
        .map(|c| serde_json::json!({ "chunk": c }).to_string())
        .collect();
    records.push("[DONE]".to_string());
    let refs: Vec<&str> = records.iter().map(String::as_str).collect();
    record_body(&refs)
}

#[allow(dead_code)]
pub fn request(workspace: &str, project: &str, chapter_order: u32) -> GenerationRequest {
    GenerationRequest::new(
        CallerIdentity {
            user_id: "u1".to_string(),
            workspace_id: workspace.to_string(),
            project_id: project.to_string(),
            chapter_order,
        },
        "Continue the scene",
    )
}
