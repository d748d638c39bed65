// SHAREFLOW CLI SUBCOMMANDS
// CLASS DECLARATIONS ARE SHARED BY run AND show:
//   --class NAME=PARENT:GUARANTEE:LIMIT[:LOAD]
// GUARANTEE/LIMIT ARE PERCENT OF THE PARENT POOL OR "-" (DON'T CARE).
// LOAD IS THE DUTY CYCLE (PERCENT) OF ONE SYNTHETIC TASK PER CPU.

pub mod run;
pub mod show;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

use shareflow::{CpuController, Share, ShareUpdate};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassSpec {
    pub name: String,
    pub parent: String,
    pub guarantee: Share,
    pub limit: Share,
    pub load_pct: u32,
}

const CLASS_PATTERN: &str =
    r"^([A-Za-z0-9_.-]+)=([A-Za-z0-9_.-]+):(\d{1,3}|-):(\d{1,3}|-)(?::(\d{1,3}))?$";

fn parse_pct(field: &str, what: &str) -> Result<Share> {
    if field == "-" {
        return Ok(Share::DONT_CARE);
    }
    let pct: u32 = field.parse().with_context(|| format!("BAD {} '{}'", what, field))?;
    if pct > 100 {
        bail!("{} {}% OUT OF RANGE (0-100)", what, pct);
    }
    Ok(Share::from_pct(pct))
}

impl ClassSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let re = Regex::new(CLASS_PATTERN)?;
        let caps = re
            .captures(text.trim())
            .ok_or_else(|| anyhow!("BAD CLASS '{}' (EXPECTED NAME=PARENT:GRT:LIM[:LOAD])", text))?;
        let load_pct = match caps.get(5) {
            Some(m) => m.as_str().parse::<u32>()?,
            None => 0,
        };
        if load_pct > 100 {
            bail!("LOAD {}% OUT OF RANGE (0-100)", load_pct);
        }
        Ok(Self {
            name: caps[1].to_string(),
            parent: caps[2].to_string(),
            guarantee: parse_pct(&caps[3], "GUARANTEE")?,
            limit: parse_pct(&caps[4], "LIMIT")?,
            load_pct,
        })
    }

    pub fn update(&self) -> ShareUpdate {
        ShareUpdate::guarantee_limit(self.guarantee, self.limit)
    }
}

// CREATE EVERY DECLARED CLASS IN ORDER. A PARENT MUST BE DECLARED FIRST.
pub fn build_classes(ctl: &CpuController, specs: &[ClassSpec], now_ns: u64) -> Result<()> {
    for spec in specs {
        let parent = ctl
            .class_by_name(&spec.parent)
            .ok_or_else(|| anyhow!("CLASS '{}': UNKNOWN PARENT '{}'", spec.name, spec.parent))?;
        if ctl.class_by_name(&spec.name).is_some() {
            bail!("CLASS '{}' DECLARED TWICE", spec.name);
        }
        ctl.create_class(parent, &spec.name, Some(spec.update()), now_ns)
            .with_context(|| format!("CLASS '{}'", spec.name))?;
    }
    Ok(())
}
