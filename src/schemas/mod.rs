use serde::Serialize;

pub(crate) mod grading;

#[derive(Debug, Serialize)]
pub(crate) struct RootResponse {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) docs: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
    pub(crate) database: &'static str,
}
