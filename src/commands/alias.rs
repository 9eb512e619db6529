//! `gog auth alias set|unset|list`.

use crate::commands::Out;
use crate::{Config, Result};
use std::collections::BTreeMap;
use tracing::warn;

/// Maps `alias` to `email` and saves the config. An existing mapping is replaced.
pub async fn alias_set(config: &mut Config, alias: &str, email: &str) -> Result<Out<()>> {
    config.set_alias(alias, email)?;
    config.save().await?;
    let alias = crate::config::normalize_alias(alias);
    let email = config.resolve_alias(&alias).unwrap_or_default().to_string();
    Ok(Out::new_message(format!("Alias {alias} now points to {email}")))
}

/// Removes `alias`. A missing alias is reported but is not an error.
pub async fn alias_unset(config: &mut Config, alias: &str) -> Result<Out<()>> {
    if !config.unset_alias(alias) {
        warn!("Alias {} not found", alias.trim());
        return Ok(Out::new_message(format!("Alias {} not found", alias.trim())));
    }
    config.save().await?;
    Ok(Out::new_message(format!("Removed alias {}", alias.trim())))
}

pub fn alias_list(config: &Config) -> Out<BTreeMap<String, String>> {
    let aliases = config.aliases().clone();
    if aliases.is_empty() {
        return Out::new("No aliases. Add one with `gog auth alias set <alias> <email>`", aliases);
    }
    let lines: Vec<String> = aliases
        .iter()
        .map(|(alias, email)| format!("  {alias} -> {email}"))
        .collect();
    Out::new(format!("Aliases:\n{}", lines.join("\n")), aliases)
}
