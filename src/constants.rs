//! File names shared between the client-side launcher and the application
//! master. These are part of the staging contract and must not change.

pub mod files {
    pub const APP_SPEC: &str = "weave.spec.json";
    pub const ARGUMENTS: &str = "arguments.json";
    pub const LOCALIZE_FILES: &str = "localizeFiles.json";
    pub const JVM_OPTIONS: &str = "jvm.opts";
    pub const LOGBACK_TEMPLATE: &str = "logback-template.xml";
    pub const CREDENTIALS: &str = "credentials.store";
}

/// Token kind of the AM to resource-manager token. It is stripped from the
/// credentials handed to containers; it is not forwardable.
pub const AM_RM_TOKEN_KIND: &str = "YARN_AM_RM_TOKEN";

pub const DEFAULT_RESERVED_MEMORY_MB: u32 = 200;
