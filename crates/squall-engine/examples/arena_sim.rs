//! Headless arena demo: one container, one match, a movement module, and
//! snapshot-on-tick delta emission printed to stdout.
//!
//! Run with: `cargo run --example arena_sim`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use squall_engine::command::{CommandSchema, ParamSpec, ParamType};
use squall_engine::module::ModuleDescriptor;
use squall_engine::prelude::*;

/// Velocity integration plus a bounce at the arena walls.
fn arena_module() -> ModuleDescriptor {
    ModuleDescriptor::new("arena")
        .component("POSITION_X", PermissionLevel::Write)
        .component("POSITION_Y", PermissionLevel::Write)
        .component("VELOCITY_X", PermissionLevel::Write)
        .component("VELOCITY_Y", PermissionLevel::Write)
        .command(
            "launch",
            CommandSchema::new()
                .param(ParamSpec::required("matchId", ParamType::Entity))
                .param(ParamSpec::required("vx", ParamType::Float))
                .param(ParamSpec::required("vy", ParamType::Float)),
            |w, _tick, args| {
                let match_id = args
                    .get_match("matchId")
                    .ok_or_else(|| CommandError::new("matchId out of range"))?;
                let entity = w.spawn(match_id)?;
                let px = w.lookup("POSITION_X")?;
                let py = w.lookup("POSITION_Y")?;
                let vx = w.lookup("VELOCITY_X")?;
                let vy = w.lookup("VELOCITY_Y")?;
                w.set(entity, px, 0.0)?;
                w.set(entity, py, 0.0)?;
                w.set(entity, vx, args.get_f64("vx").unwrap_or(0.0))?;
                w.set(entity, vy, args.get_f64("vy").unwrap_or(0.0))?;
                Ok(())
            },
        )
        .system("integrate", |w, _tick| {
            let px = w.lookup("POSITION_X")?;
            let py = w.lookup("POSITION_Y")?;
            let vx = w.lookup("VELOCITY_X")?;
            let vy = w.lookup("VELOCITY_Y")?;
            for entity in w.query(&[px, py, vx, vy]) {
                let x = w.get(entity, px)?.unwrap_or(0.0) + w.get(entity, vx)?.unwrap_or(0.0);
                let y = w.get(entity, py)?.unwrap_or(0.0) + w.get(entity, vy)?.unwrap_or(0.0);
                w.set(entity, px, x)?;
                w.set(entity, py, y)?;
            }
            Ok(())
        })
        .system_after("bounce", &["integrate"], |w, _tick| {
            const ARENA: f64 = 100.0;
            let px = w.lookup("POSITION_X")?;
            let vx = w.lookup("VELOCITY_X")?;
            for entity in w.query(&[px, vx]) {
                let x = w.get(entity, px)?.unwrap_or(0.0);
                if x.abs() > ARENA {
                    let v = w.get(entity, vx)?.unwrap_or(0.0);
                    w.set(entity, vx, -v)?;
                    w.set(entity, px, x.clamp(-ARENA, ARENA))?;
                }
            }
            Ok(())
        })
}

/// Prints each emitted delta as one line.
struct DeltaPrinter;

impl TickListener for DeltaPrinter {
    fn on_tick_complete(
        &self,
        match_id: MatchId,
        tick: u64,
        snapshot: Option<&SnapshotPayload>,
    ) -> anyhow::Result<()> {
        if let Some(SnapshotPayload::Delta(delta)) = snapshot {
            println!(
                "match {match_id} tick {tick}: {} changes (ratio {:.3})",
                delta.change_count, delta.compression_ratio
            );
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    squall_engine::init_logging();

    let container = Container::new(ContainerConfig {
        snapshot_on_tick: Some(SnapshotMode::Delta),
        ..ContainerConfig::default()
    });
    container.install(arena_module())?;
    container.start()?;
    container.ticks().add_listener(Arc::new(DeltaPrinter));

    let m = container.matches().create()?;
    for i in 0..4 {
        container.commands().enqueue(
            "launch",
            json!({"matchId": m.to_raw(), "vx": 5.0 + i as f64, "vy": 1.0 - i as f64}),
        )?;
    }

    container.ticks().start_auto(Duration::from_millis(16))?;
    std::thread::sleep(Duration::from_secs(1));
    container.ticks().stop_auto()?;

    let snapshot = container.snapshots().full(m)?;
    println!(
        "final tick {}: {} entities, hash {}",
        snapshot.tick,
        snapshot.entities.len(),
        &snapshot.state_hash[..16]
    );

    container.stop()?;
    Ok(())
}
