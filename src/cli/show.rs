// SHAREFLOW SHOW: BUILD THE DECLARED TREE AND PRINT ONE REPORT.
// NO TASKS ARE SPAWNED; THE NUMBERS ARE THE IDLE-MACHINE ENTITLEMENTS.

use anyhow::Result;

use shareflow::CpuController;

use super::{build_classes, ClassSpec};

pub fn render(ctl: &CpuController, specs: &[ClassSpec]) -> Result<String> {
    build_classes(ctl, specs, 1)?;
    Ok(ctl.report())
}

pub fn run_show(ctl: &CpuController, specs: &[ClassSpec]) -> Result<()> {
    println!("SHAREFLOW CLASS TREE ({} CPUS)", ctl.nr_cpus());
    println!();
    print!("{}", render(ctl, specs)?);
    Ok(())
}
