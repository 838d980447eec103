pub fn relayd_version() -> &'static str {
    // See build.rs
    env!("RELAYD_CI_TAG")
}

pub fn relayd_commit() -> &'static str {
    // See build.rs
    env!("RELAYD_GIT_COMMIT")
}

pub fn relayd_build_timestamp() -> &'static str {
    // See build.rs
    env!("RELAYD_BUILD_TIMESTAMP")
}

pub fn relayd_target_triple() -> &'static str {
    // See build.rs
    env!("RELAYD_TARGET_TRIPLE")
}
