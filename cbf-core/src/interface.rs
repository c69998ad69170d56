//! Versioned interface checks for incoming command documents.
//!
//! Every configuration document names the schema it was written against in
//! its `interface` field. A command only accepts the schema versions listed
//! for it; everything else is turned away before any state is touched.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::config::InterfaceConfig;

const SCHEMA_ROOT: &str = "https://schema.skao.int";

const BUILTIN_ALLOW_LIST: &[(&str, &[&str])] = &[
    (
        "assignresources",
        &["ska-csp-assignresources/2.2", "ska-csp-assignresources/2.3"],
    ),
    (
        "configurescan",
        &[
            "ska-csp-configurescan/4.0",
            "ska-csp-configurescan/4.1",
            "ska-csp-configurescan/5.0",
        ],
    ),
    ("scan", &["ska-csp-scan/2.2", "ska-csp-scan/2.3"]),
    (
        "releaseresources",
        &["ska-csp-releaseresources/2.2", "ska-csp-releaseresources/2.3"],
    ),
    ("delaymodel", &["ska-mid-csp-delaymodel/3.0"]),
];

/// Command name to accepted interface URIs.
#[derive(Clone, Debug)]
pub struct InterfaceValidator {
    allow_list: BTreeMap<String, Vec<String>>,
}

impl Default for InterfaceValidator {
    fn default() -> Self {
        let allow_list = BUILTIN_ALLOW_LIST
            .iter()
            .map(|(command, versions)| {
                let uris = versions
                    .iter()
                    .map(|v| format!("{SCHEMA_ROOT}/{v}"))
                    .collect();
                ((*command).to_string(), uris)
            })
            .collect();
        Self { allow_list }
    }
}

impl InterfaceValidator {
    /// Built-in list with the configured commands replaced wholesale.
    pub fn from_config(config: &InterfaceConfig) -> Self {
        let mut validator = Self::default();
        for (command, uris) in &config.allow_list {
            validator
                .allow_list
                .insert(command.to_ascii_lowercase(), uris.clone());
        }
        validator
    }

    pub fn accepted_versions(&self, command: &str) -> &[String] {
        self.allow_list
            .get(&command.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Check `document` against the versions allowed for `command`.
    ///
    /// Returns `(true, "")` on success. Never panics or errors; anything
    /// unexpected is reported as a rejection reason.
    pub fn validate(&self, document: &str, command: &str) -> (bool, String) {
        let parsed: Value = match serde_json::from_str(document) {
            Ok(value) => value,
            Err(err) => {
                debug!(command, error = %err, "interface document rejected");
                return (
                    false,
                    format!("{command} document could not be parsed: {err}"),
                );
            }
        };
        self.validate_value(&parsed, command)
    }

    pub fn validate_value(
        &self,
        document: &Value,
        command: &str,
    ) -> (bool, String) {
        let Some(interface) = document.get("interface") else {
            return (false, "missing required interface parameter".to_string());
        };
        let Some(interface) = interface.as_str() else {
            return (
                false,
                format!("interface parameter {interface} is not a string"),
            );
        };

        if self
            .accepted_versions(command)
            .iter()
            .any(|accepted| accepted == interface)
        {
            (true, String::new())
        } else {
            (
                false,
                format!(
                    "interface {interface} is not supported for command {command}"
                ),
            )
        }
    }
}

/// [`InterfaceValidator::validate`] against the built-in allow-list.
pub fn validate_interface(document: &str, command: &str) -> (bool, String) {
    InterfaceValidator::default().validate(document, command)
}
