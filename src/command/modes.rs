use crate::{
    float::TerseF64,
    registry::{Kind, REGISTRY},
};
use clap::Parser;
use console::style;

/// List available metric modes.
#[derive(Parser, Clone)]
#[group(skip)]
pub struct Args {
    /// Only list full-reference (fr) or no-reference (nr) modes.
    #[arg(long, value_enum)]
    pub kind: Option<Kind>,
}

pub fn modes(Args { kind }: Args) -> anyhow::Result<()> {
    println!(
        "{}",
        style(format!(
            "{:<14}{:<6}{:<11}{:<8}{:<8}{}",
            "mode", "kind", "output", "accel", "fps", "provision"
        ))
        .bold()
    );
    let only = kind.map(|k| REGISTRY.modes_for_kind(k));
    for d in REGISTRY
        .iter()
        .filter(|d| only.as_ref().is_none_or(|m| m.contains(d.mode)))
    {
        let fps = match d.output.sample_fps(None) {
            Some(fps) => TerseF64(fps.into()).to_string(),
            None => "-".into(),
        };
        let accel = match (d.accelerated, d.unsupported) {
            (false, _) => "no".to_owned(),
            (true, []) => "yes".to_owned(),
            (true, unsupported) => {
                let names: Vec<_> = unsupported.iter().map(|b| b.as_str()).collect();
                format!("!{}", names.join(","))
            }
        };
        println!(
            "{:<14}{:<6}{:<11}{:<8}{:<8}{}",
            d.mode,
            d.kind,
            d.output,
            accel,
            fps,
            style(d.provision.label()).dim()
        );
    }
    Ok(())
}
