use dotenv::dotenv;

/// Load `.env`: `CRM_BRIDGE_ENV` names an explicit file, otherwise the
/// working directory is tried, then the crate root.
pub fn ensure_dotenv() {
    if let Ok(file) = std::env::var("CRM_BRIDGE_ENV") {
        if dotenv::from_filename(&file).is_ok() {
            return;
        }
    }
    if dotenv().is_ok() {
        return;
    }
    let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
    let _ = dotenv::from_filename(candidate);
}
