use fence_core::{DomainRecord, Encoding};
use fencegrid_persistence::DomainKey;
use serde::Serialize;

use super::Env;

#[derive(Serialize)]
struct DomainView<'a> {
    id: &'a str,
    name: &'a str,
    is_global: bool,
    config: serde_json::Value,
}

impl<'a> From<&'a DomainRecord> for DomainView<'a> {
    fn from(row: &'a DomainRecord) -> Self {
        let config = serde_json::from_slice(&row.data).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&row.data).into_owned())
        });
        Self {
            id: &row.id,
            name: &row.name,
            is_global: row.is_global,
            config,
        }
    }
}

/// Accept only well-formed JSON so `describe` can render it back.
fn parse_config(data: &str) -> anyhow::Result<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_str(data)?;
    Ok(serde_json::to_vec(&value)?)
}

pub fn register(
    env: &Env,
    name: &str,
    id: Option<String>,
    global: bool,
    data: &str,
) -> anyhow::Result<()> {
    let row = DomainRecord {
        id: id.unwrap_or_else(|| name.to_string()),
        name: name.to_string(),
        is_global: global,
        data: parse_config(data)?,
        encoding: Encoding::Json,
    };
    let version = env.store.create_domain(&env.ctx(), &row)?;
    println!("✓ Registered domain {} ({}) at notification version {version}", row.name, row.id);
    Ok(())
}

pub fn describe(env: &Env, name: &str, by_id: bool) -> anyhow::Result<()> {
    let key = if by_id {
        DomainKey::Id(name.to_string())
    } else {
        DomainKey::Name(name.to_string())
    };
    let row = env.store.get_domain(&key)?;
    println!("{}", serde_json::to_string_pretty(&DomainView::from(&row))?);
    Ok(())
}

pub fn list(env: &Env, page_size: usize, after: Option<&str>) -> anyhow::Result<()> {
    let rows = env.store.list_domains(page_size, after)?;
    let views: Vec<DomainView<'_>> = rows.iter().map(DomainView::from).collect();
    println!("{}", serde_json::to_string_pretty(&views)?);
    if rows.len() == page_size {
        if let Some(last) = rows.last() {
            eprintln!("more domains may follow: --after {}", last.id);
        }
    }
    Ok(())
}

pub fn update(
    env: &Env,
    name: &str,
    data: &str,
    expected_version: Option<u64>,
) -> anyhow::Result<()> {
    let expected = match expected_version {
        Some(v) => v,
        None => env.store.domain_metadata()?,
    };
    let mut row = env.store.get_domain(&DomainKey::Name(name.to_string()))?;
    row.data = parse_config(data)?;
    let version = env.store.update_domain(&env.ctx(), &row, expected)?;
    println!("✓ Updated domain {name}, notification version now {version}");
    Ok(())
}

pub fn delete(env: &Env, name: &str) -> anyhow::Result<()> {
    if env
        .store
        .delete_domain(&env.ctx(), &DomainKey::Name(name.to_string()))?
    {
        println!("✓ Deleted domain {name}");
    } else {
        println!("domain {name} not found");
    }
    Ok(())
}

pub fn metadata(env: &Env) -> anyhow::Result<()> {
    println!("{}", env.store.domain_metadata()?);
    Ok(())
}
