//! Interactive window for the effect.
//!
//! Ticks the effect on every redraw and presents its output layer.
//!
//! | Key | Action |
//! |-----|--------|
//! | `Space`, `M` | Toggle Interactive / Rain |
//! | `R` | Reset fluid |
//! | `F` `P` `C` `V` | Toggle drawing of fluid, particles, capture, flow |
//! | `H` `J` | Toggle horizontal / vertical flip |
//! | `S` | Save the config |
//! | `Escape` | Quit |
//!
//! Dragging with the left mouse button sets the clip rectangle.

mod gpu;

use std::path::PathBuf;
use std::sync::Arc;

use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::{Window, WindowId};

use crate::config::{DrawConfig, EffectConfig};
use crate::effect::{FluidParticlesEffect, FrameSource};
use crate::error::ViewerError;
use crate::input::{Drag, Input, Key};
use crate::source::{ImageSequenceSource, SyntheticSource};
use crate::time::Time;

pub use gpu::Presenter;

/// Config file written by `S` when none was loaded.
pub const DEFAULT_CONFIG_PATH: &str = "lumenflow.json";

/// Resolution of the built-in synthetic camera.
const SYNTHETIC_SIZE: (u32, u32) = (640, 480);

/// Open a window and run the effect until it is closed.
///
/// `config_path` is loaded if given (falling back to defaults when it cannot
/// be read) and is where `S` saves. `frames_dir` replaces the synthetic
/// camera with the image files of a directory.
pub fn run(config_path: Option<PathBuf>, frames_dir: Option<PathBuf>) -> Result<(), ViewerError> {
    let config = match &config_path {
        Some(path) => EffectConfig::load(path).unwrap_or_else(|e| {
            log::warn!("Using default config, could not load {}: {}", path.display(), e);
            EffectConfig::default()
        }),
        None => EffectConfig::default(),
    };

    let source: Box<dyn FrameSource> = match frames_dir {
        Some(dir) => Box::new(ImageSequenceSource::open(dir)?),
        None => Box::new(SyntheticSource::new(SYNTHETIC_SIZE.0, SYNTHETIC_SIZE.1)),
    };

    let effect = FluidParticlesEffect::new(config, source)?;
    let save_path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let event_loop = EventLoop::new()?;
    let mut app = App::new(effect, save_path);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct App {
    effect: FluidParticlesEffect,
    save_path: PathBuf,
    time: Time,
    input: Input,
    window: Option<Arc<Window>>,
    presenter: Option<Presenter>,
    /// Set when startup fails inside the event loop.
    error: Option<ViewerError>,
}

impl App {
    fn new(effect: FluidParticlesEffect, save_path: PathBuf) -> Self {
        Self {
            effect,
            save_path,
            time: Time::new(),
            input: Input::new(),
            window: None,
            presenter: None,
            error: None,
        }
    }

    fn create_window(&mut self, event_loop: &ActiveEventLoop) -> Result<(), ViewerError> {
        let (width, height) = self.effect.output().dimensions();
        let window_attrs = Window::default_attributes()
            .with_title("lumenflow")
            .with_inner_size(winit::dpi::LogicalSize::new(width, height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let presenter = pollster::block_on(Presenter::new(window.clone(), (width, height)))?;
        let (sw, sh) = presenter.surface_size();
        self.input.set_window_size(sw, sh);
        self.window = Some(window);
        self.presenter = Some(presenter);
        Ok(())
    }

    /// React to this frame's keys and drags.
    fn apply_input(&mut self, event_loop: &ActiveEventLoop) {
        for drag in self.input.drags() {
            match *drag {
                Drag::Started(p) => self.effect.drag_start(p),
                Drag::Moved(p) => self.effect.drag_update(p),
                Drag::Ended(p) => self.effect.drag_end(p),
            }
        }

        if self.input.key_pressed(Key::Escape) {
            event_loop.exit();
        }
        if self.input.key_pressed(Key::Space) || self.input.key_pressed(Key::M) {
            self.effect.set_mode(self.effect.mode().toggled());
        }
        if self.input.key_pressed(Key::R) {
            self.effect.reset_fluid();
        }

        let toggles: [(Key, fn(&mut DrawConfig)); 6] = [
            (Key::F, |d| d.fluid = !d.fluid),
            (Key::P, |d| d.particles = !d.particles),
            (Key::C, |d| d.capture = !d.capture),
            (Key::V, |d| d.flow = !d.flow),
            (Key::H, |d| d.flip_horizontal = !d.flip_horizontal),
            (Key::J, |d| d.flip_vertical = !d.flip_vertical),
        ];
        let mut config = self.effect.config().clone();
        let mut changed = false;
        for (key, toggle) in toggles {
            if self.input.key_pressed(key) {
                toggle(&mut config.draw);
                changed = true;
            }
        }
        if changed {
            log::debug!("Draw settings: {:?}", config.draw);
            if let Err(e) = self.effect.set_config(config) {
                log::warn!("Could not apply draw settings: {}", e);
            }
        }

        if self.input.key_pressed(Key::S) {
            match self.effect.config().save(&self.save_path) {
                Ok(()) => log::info!("Saved config to {}", self.save_path.display()),
                Err(e) => log::warn!("Could not save config: {}", e),
            }
        }

        self.input.begin_frame();
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        self.apply_input(event_loop);
        self.time.update();
        self.effect.tick(self.time.elapsed());
        let layer = self.effect.render();

        if let Some(presenter) = &mut self.presenter {
            presenter.upload(layer);
            match presenter.render() {
                Ok(_) => {}
                Err(wgpu::SurfaceError::Lost) | Err(wgpu::SurfaceError::Outdated) => {
                    let (width, height) = presenter.surface_size();
                    presenter.resize(winit::dpi::PhysicalSize { width, height });
                }
                Err(wgpu::SurfaceError::OutOfMemory) => {
                    log::error!("Out of GPU memory");
                    event_loop.exit();
                }
                Err(e) => log::warn!("Render error: {:?}", e),
            }
        }

        if self.time.frame() % 300 == 0 {
            log::debug!(
                "{:.1} fps, {} particles",
                self.time.fps(),
                self.effect.particles().len()
            );
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.create_window(event_loop) {
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        self.input.handle_event(&event);

        match event {
            WindowEvent::CloseRequested => {
                self.effect.deactivate();
                event_loop.exit();
            }
            WindowEvent::Resized(physical_size) => {
                self.input.set_window_size(physical_size.width, physical_size.height);
                if let Some(presenter) = &mut self.presenter {
                    presenter.resize(physical_size);
                }
            }
            WindowEvent::RedrawRequested => {
                self.redraw(event_loop);
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }
}
