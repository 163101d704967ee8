// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod scene;

use anyhow::Result;
use clap::Parser;
use scene::{Scene, SceneSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use stratum_core::{init_tracing, load_toml, Config};
use stratum_render::FrameStatus;
use stratum_vk::ash::vk;
use tracing::{debug, error, info, warn};

use stratum_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with [context] and [render] sections
    #[arg(long, default_value = "stratum.toml")]
    config: PathBuf,
    /// Overrides render.frames_in_flight from the file
    #[arg(long)]
    frames_in_flight: Option<usize>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum PresentModeCfg {
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

impl PresentModeCfg {
    fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            PresentModeCfg::Fifo => vk::PresentModeKHR::FIFO,
            PresentModeCfg::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModeCfg::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
struct RenderCfg {
    frames_in_flight: usize,
    present_mode: PresentModeCfg,
    clear_color: [f32; 4],
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            frames_in_flight: 2,
            present_mode: PresentModeCfg::default(),
            clear_color: [0.02, 0.02, 0.04, 1.0],
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
struct AppCfg {
    #[serde(default)]
    context: Config,
    #[serde(default)]
    render: RenderCfg,
}

impl AppCfg {
    fn settings(&self) -> SceneSettings {
        SceneSettings {
            context: self.context.clone(),
            frames_in_flight: self.render.frames_in_flight.max(1),
            present_mode: Some(self.render.present_mode.to_vk()),
            clear_color: self.render.clear_color,
        }
    }
}

/// Missing or malformed files fall back to defaults. Tracing is not up
/// yet, so the outcome is returned for logging by the caller.
fn load_cfg(path: &Path) -> (AppCfg, Option<String>) {
    match load_toml::<AppCfg>(path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppCfg::default(), Some(format!("{e}; using defaults"))),
    }
}

fn apply_overrides(cfg: &mut AppCfg, args: &Args) {
    if let Some(n) = args.frames_in_flight {
        cfg.render.frames_in_flight = n;
    }
}

struct App {
    cfg: AppCfg,
    window: Option<Window>,
    scene: Option<Scene>,
    exiting: bool,
    paused: bool,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        App {
            cfg,
            window: None,
            scene: None,
            exiting: false,
            paused: false,
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        if let Some(scene) = self.scene.take() {
            if let Err(e) = scene.destroy() {
                error!("teardown failed: {e:#}");
            }
        }
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let window = match event_loop.create_window(Window::default_attributes().with_title("stratum")) {
            Ok(w) => w,
            Err(e) => {
                error!("create_window: {e}");
                event_loop.exit();
                return;
            }
        };

        match Scene::new(&self.cfg.settings(), &window) {
            Ok(scene) => {
                let extent = scene.extent();
                info!("scene up at {}x{}", extent.width, extent.height);
                self.scene = Some(scene);
            }
            Err(e) => {
                error!("vulkan init failed: {e:#}");
                event_loop.exit();
                return;
            }
        }

        event_loop.set_control_flow(ControlFlow::Wait);
        let size = window.inner_size();
        self.paused = size.width == 0 || size.height == 0;
        if !self.paused {
            window.request_redraw();
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(window) = &self.window else {
            return;
        };
        if window_id != window.id() {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let now_paused = new_size.width == 0 || new_size.height == 0;
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        new_size.width, new_size.height, self.paused
                    );
                }
                if self.paused {
                    return;
                }
                if let Some(scene) = &mut self.scene {
                    if let Err(e) = scene.resize(window) {
                        error!("resize failed: {e:#}");
                        self.shutdown(event_loop);
                        return;
                    }
                }
                window.request_redraw();
            }

            WindowEvent::Occluded(occluded) => {
                let size = window.inner_size();
                self.paused = occluded || size.width == 0 || size.height == 0;
                debug!("Occluded={occluded} → paused={}", self.paused);
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                let Some(scene) = &mut self.scene else {
                    return;
                };
                match scene.frame(window) {
                    Ok(FrameStatus::Resized) => debug!("frame skipped for resize"),
                    Ok(FrameStatus::Presented { resized: true, .. }) => {
                        debug!("presented; surface rebuilt")
                    }
                    Ok(FrameStatus::Presented { .. }) => {}
                    Err(e) => {
                        error!("render error: {e:#}");
                        self.shutdown(event_loop);
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        event_loop.set_control_flow(ControlFlow::Wait);
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (mut cfg, cfg_note) = load_cfg(&args.config);
    apply_overrides(&mut cfg, &args);
    init_tracing(&cfg.context);
    if let Some(note) = cfg_note {
        warn!("{note}");
    }
    info!(
        "frames in flight {}, present mode {:?}",
        cfg.render.frames_in_flight, cfg.render.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_section_parses_with_defaults() {
        let cfg: AppCfg = toml::from_str(
            r#"
            [context]
            enable_validation_layers = false

            [render]
            present_mode = "mailbox"
            "#,
        )
        .unwrap();
        assert!(!cfg.context.enable_validation_layers);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Mailbox);
        assert_eq!(cfg.render.frames_in_flight, 2);
        assert_eq!(cfg.render.clear_color, RenderCfg::default().clear_color);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg: AppCfg = toml::from_str("").unwrap();
        assert_eq!(cfg.render, RenderCfg::default());
        assert_eq!(cfg.context, Config::default());
    }

    #[test]
    fn unknown_present_mode_is_rejected() {
        assert!(toml::from_str::<AppCfg>("[render]\npresent_mode = \"vsync\"").is_err());
    }

    #[test]
    fn flag_overrides_file() {
        let mut cfg: AppCfg = toml::from_str("[render]\nframes_in_flight = 3").unwrap();
        let args = Args::parse_from(["stratum", "--frames-in-flight", "4"]);
        apply_overrides(&mut cfg, &args);
        assert_eq!(cfg.render.frames_in_flight, 4);

        let args = Args::parse_from(["stratum"]);
        let mut cfg: AppCfg = toml::from_str("[render]\nframes_in_flight = 3").unwrap();
        apply_overrides(&mut cfg, &args);
        assert_eq!(cfg.render.frames_in_flight, 3);
        assert_eq!(args.config, PathBuf::from("stratum.toml"));
    }

    #[test]
    fn settings_never_ask_for_zero_slots() {
        let mut cfg = AppCfg::default();
        cfg.render.frames_in_flight = 0;
        let s = cfg.settings();
        assert_eq!(s.frames_in_flight, 1);
        assert_eq!(s.present_mode, Some(vk::PresentModeKHR::FIFO));
    }

    #[test]
    fn missing_file_falls_back() {
        let (cfg, note) = load_cfg(Path::new("/nonexistent/stratum.toml"));
        assert_eq!(cfg.render, RenderCfg::default());
        assert!(note.is_some());
    }

    #[test]
    fn file_on_disk_goes_through_core_loader() {
        let path = std::env::temp_dir().join(format!("stratum-app-{}.toml", std::process::id()));
        std::fs::write(&path, "[render]\nframes_in_flight = 3\n[context]\nenable_logging = false\n").unwrap();
        let (cfg, note) = load_cfg(&path);
        assert!(note.is_none());
        assert_eq!(cfg.render.frames_in_flight, 3);
        assert!(!cfg.context.enable_logging);

        std::fs::write(&path, "[render]\npresent_mode = \"vsync\"\n").unwrap();
        let (cfg, note) = load_cfg(&path);
        assert_eq!(cfg.render, RenderCfg::default());
        assert!(note.unwrap().contains("failed to parse config"));
        let _ = std::fs::remove_file(&path);
    }
}
