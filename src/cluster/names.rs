//! Object naming for per-slot Kubernetes resources
//!
//! The deployment, PV and PVC names are stable per slot so a restarted
//! control plane can find them again. The service name and app label embed
//! a claim-token prefix so consecutive claims on the same slot never share
//! a service.

/// Stable name of the slot's deployment.
pub fn env_deployment_name(env_id: &str) -> String {
    format!("env-{env_id}-deployment").to_lowercase()
}

/// App label selecting the slot's pods for one claim.
pub fn env_app_label(env_id: &str, claim_token: &str) -> String {
    format!("env-{env_id}-{}", short_token(claim_token))
}

/// Name of the slot's service for one claim.
pub fn env_service_name(env_id: &str, claim_token: &str) -> String {
    format!("env-{env_id}-{}-service", short_token(claim_token))
}

pub fn env_pv_name(env_id: &str) -> String {
    format!("env-{env_id}-pv").to_lowercase()
}

pub fn env_pv_path(env_id: &str) -> String {
    format!("/env-{env_id}").to_lowercase()
}

pub fn env_pvc_name(env_id: &str) -> String {
    format!("env-{env_id}-pvc").to_lowercase()
}

pub fn provisioner_job_name(env_id: &str) -> String {
    format!("env-{env_id}-provision-job").to_lowercase()
}

pub fn provisioner_app_label(env_id: &str) -> String {
    format!("env-{env_id}-provision").to_lowercase()
}

/// First eight alphanumeric characters of a claim token, lowercased, so the
/// result is valid inside DNS-1123 names.
fn short_token(claim_token: &str) -> String {
    claim_token
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<String>()
        .to_lowercase()
}
