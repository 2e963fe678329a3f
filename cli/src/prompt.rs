//! Hidden password input.

use anyhow::{bail, Context};

/// Prompt for a password (hidden input)
pub fn read_password() -> anyhow::Result<String> {
    rpassword::prompt_password("Input password: ").context("failed to read password")
}

/// Prompt twice for a new password; both entries must match.
pub fn read_new_password() -> anyhow::Result<String> {
    let first = read_password()?;
    let second = rpassword::prompt_password("Input password again: ")
        .context("failed to read password")?;
    if first != second {
        bail!("passwords do not match");
    }
    Ok(second)
}
