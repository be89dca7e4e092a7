/// SDK name and version reported to the specs server and stamped into payloads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SdkMetadata {
    /// SDK name.
    pub name: &'static str,
    /// Version of SDK.
    pub version: &'static str,
}

pub(crate) const SDK_METADATA: SdkMetadata = SdkMetadata {
    name: env!("CARGO_PKG_NAME"),
    version: env!("CARGO_PKG_VERSION"),
};
