use crate::kernel::SESSION_BANNER;
use crate::runner::{DimrConfigExporter, RUN_LOG_FILE_NAME};

const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const PKG_HOMEPAGE: Option<&str> = option_env!("CARGO_PKG_HOMEPAGE");
const PKG_REPOSITORY: Option<&str> = option_env!("CARGO_PKG_REPOSITORY");
const PKG_LICENSE: Option<&str> = option_env!("CARGO_PKG_LICENSE");

/// Version of the configuration file the built-in exporter writes.
pub const KERNEL_PROTOCOL: u32 = 1;

pub fn describe() -> String {
    let mut lines = Vec::new();
    lines.push(format!("{PKG_NAME} {PKG_VERSION}"));
    lines.push(PKG_DESCRIPTION.to_string());

    if let Some(homepage) = PKG_HOMEPAGE.filter(|s| !s.is_empty()) {
        lines.push(format!("homepage: {homepage}"));
    }
    if let Some(repo) = PKG_REPOSITORY.filter(|s| !s.is_empty()) {
        lines.push(format!("repository: {repo}"));
    }
    if let Some(license) = PKG_LICENSE.filter(|s| !s.is_empty()) {
        lines.push(format!("license: {license}"));
    }

    lines.push(format!(
        "kernel protocol: {KERNEL_PROTOCOL} ({}, log {RUN_LOG_FILE_NAME})",
        DimrConfigExporter::FILE_NAME
    ));
    lines.push(format!("session banner: {SESSION_BANNER}"));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_names_package_and_protocol() {
        let text = describe();
        assert!(text.starts_with(&format!("dimr-kit {PKG_VERSION}")));
        assert!(text.contains("kernel protocol: 1 (dimr.json, log dimr_redirected.log)"));
    }
}
