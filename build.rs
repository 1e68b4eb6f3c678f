//! Build script for tunwall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `tunwall --version`.

fn main() {
    // Re-run build if the default post-rules location is overridden by packagers
    println!("cargo:rerun-if-env-changed=TUNWALL_POST_RULES_PATH");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
