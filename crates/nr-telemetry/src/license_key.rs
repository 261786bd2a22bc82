// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;

pub type LicenseKeyResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// Source of the license key. A dynamic key is resolved on first use and cached for the
/// lifetime of the process. Surrounding whitespace, usually a trailing newline left by a
/// secret store, is stripped.
#[derive(Clone)]
pub enum LicenseKeyFactory {
    Static(String),
    Dynamic {
        resolver_fn: LicenseKeyResolverFn,
        license_key: Arc<OnceCell<String>>,
    },
}

impl LicenseKeyFactory {
    pub fn new_from_resolver(resolver_fn: LicenseKeyResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            license_key: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static_key(license_key: &str) -> Self {
        Self::Static(license_key.trim().to_string())
    }

    pub async fn get_license_key(&self) -> &str {
        match self {
            Self::Static(license_key) => license_key,
            Self::Dynamic {
                resolver_fn,
                license_key,
            } => {
                license_key
                    .get_or_init(|| async { (resolver_fn)().await.trim().to_string() })
                    .await
            }
        }
    }
}

impl Debug for LicenseKeyFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LicenseKeyFactory")
    }
}
