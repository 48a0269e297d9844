//! Colored tabular output for `list`/`info`, in the same spirit as the
//! teacher's `show.rs` -- small, `eprintln!`/`println!`-based, no generic
//! table-rendering dependency pulled in just for this.

use colored::Colorize;

use cellar_core::model::SecretInfo;

pub fn list(infos: &[SecretInfo]) {
    if infos.is_empty() {
        println!("{}", "(no secrets)".dimmed());
        return;
    }

    println!("{:<32} {:>8}  {}", "NAME".bold(), "ACTIVE".bold(), "VERSIONS".bold());
    for info in infos {
        println!(
            "{:<32} {:>8}  {}",
            info.name,
            info.active_version.to_string().green(),
            versions_summary(&info.versions)
        );
    }
}

pub fn info(info: &SecretInfo) {
    println!("{}: {}", "name".bold(), info.name);
    println!("{}: {}", "active version".bold(), info.active_version.to_string().green());
    println!("{}: {}", "versions".bold(), versions_summary(&info.versions));
}

fn versions_summary(versions: &[u64]) -> String {
    versions
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
