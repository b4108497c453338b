//! Build-time cache constants.

/// Name of the cache generation this build owns. Every other generation is
/// stale and gets removed on activation.
pub const CACHE_NAME: &str = "salus-calculator-v3";

/// Assets required for the calculator to work offline, relative to the origin.
pub const ASSETS: &[&str] = &[
  "./",
  "./index.html",
  "./manifest.json",
  "./profit.png",
  "./icon.webp",
];
