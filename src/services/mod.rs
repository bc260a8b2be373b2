pub(crate) mod ai_client;
pub(crate) mod attempts;
pub(crate) mod grading;
pub(crate) mod normalizer;
