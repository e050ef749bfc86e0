/// Human readable version, composed at build time from the package version,
/// the git revision (when built from a checkout) and the build timestamp.
pub const VERSION: &str = env!("SSHMUX_VERSION");

pub const GIT_SHA: &str = env!("SSHMUX_GIT_SHA");

pub const BUILD_TIME: &str = env!("SSHMUX_BUILD_TIME");
