//! Shared test fixtures.

use airlift_core::declcfg::{Bundle, Property, PROPERTY_PACKAGE, SCHEMA_BUNDLE};

pub fn sample_bundle(package: &str, name: &str, version: &str) -> Bundle {
    Bundle {
        schema: SCHEMA_BUNDLE.to_string(),
        name: name.to_string(),
        package: package.to_string(),
        image: format!("quay.io/{package}/{name}"),
        properties: vec![Property {
            kind: PROPERTY_PACKAGE.to_string(),
            value: serde_json::json!({"packageName": package, "version": version}),
        }],
        related_images: vec![],
    }
}
