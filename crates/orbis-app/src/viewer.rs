//! Windowed globe viewer.
//!
//! [`Viewer`] owns the window, the wgpu context and the [`Planet`], forwards
//! winit input to the orbit camera and draws one planet frame per redraw.

use std::sync::Arc;

use glam::Vec2;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, MouseButton, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::KeyCode;
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

use orbis_config::Config;
use orbis_input::{KeyEventKind, KeyboardDispatcher, ListenerId, MouseState};
use orbis_planet::{FrameRenderable, Layer, Planet, PlanetError};
use orbis_quadtree::{LayerId, TileProvider};
use orbis_render::{GpuContext, RenderContextError, WgpuContext};

use crate::camera::OrbitCamera;
use crate::game_loop::FrameClock;
use crate::tiles::{ProceduralProvider, TileSource, TileWorkerPool};

/// Terrain amplitude of the procedural height source, in meters.
pub const TERRAIN_AMPLITUDE_M: f32 = 4_000.0;

/// Height factors cycled through by the `H` key.
pub const HEIGHT_FACTORS: [f64; 4] = [1.0, 2.0, 5.0, 10.0];

/// Cursor travel, in pixels, below which a left press and release is a click.
const CLICK_SLOP_PX: f32 = 4.0;

const CONTROLS: ListenerId = ListenerId(1);

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("failed to create event loop: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),

    #[error("failed to start tile workers: {0}")]
    Workers(#[from] std::io::Error),

    #[error("failed to create window: {0}")]
    Window(#[from] winit::error::OsError),

    #[error("failed to initialize GPU: {0}")]
    Render(#[from] RenderContextError),

    #[error(transparent)]
    Planet(#[from] PlanetError),
}

/// Intents collected from the keyboard for the current frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Controls {
    /// Orbit direction, x east and y north, summed over held keys.
    pub orbit: Vec2,
    /// Positive zooms in.
    pub zoom: f32,
    pub toggle_terrain: bool,
    pub next_height_factor: bool,
    pub cycle_base: bool,
    pub quit: bool,
}

impl Controls {
    /// Clear the one-shot requests after they have been applied.
    pub fn take_frame(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// Register the viewer's key bindings on `dispatcher`.
pub fn bind_controls(dispatcher: &mut KeyboardDispatcher<Controls>) {
    let held: [(KeyCode, Vec2, f32); 10] = [
        (KeyCode::ArrowLeft, Vec2::NEG_X, 0.0),
        (KeyCode::KeyA, Vec2::NEG_X, 0.0),
        (KeyCode::ArrowRight, Vec2::X, 0.0),
        (KeyCode::KeyD, Vec2::X, 0.0),
        (KeyCode::ArrowUp, Vec2::Y, 0.0),
        (KeyCode::KeyW, Vec2::Y, 0.0),
        (KeyCode::ArrowDown, Vec2::NEG_Y, 0.0),
        (KeyCode::KeyS, Vec2::NEG_Y, 0.0),
        (KeyCode::KeyE, Vec2::ZERO, 1.0),
        (KeyCode::KeyQ, Vec2::ZERO, -1.0),
    ];
    for (key, orbit, zoom) in held {
        dispatcher.add_event(KeyEventKind::KeyPress, Some(key), CONTROLS, move |c, _| {
            c.orbit += orbit;
            c.zoom += zoom;
        });
    }

    dispatcher.add_event(
        KeyEventKind::CharKeyPress,
        Some(KeyCode::KeyT),
        CONTROLS,
        |c, _| c.toggle_terrain = true,
    );
    dispatcher.add_event(
        KeyEventKind::CharKeyPress,
        Some(KeyCode::KeyH),
        CONTROLS,
        |c, _| c.next_height_factor = true,
    );
    dispatcher.add_event(
        KeyEventKind::CharKeyPress,
        Some(KeyCode::KeyB),
        CONTROLS,
        |c, _| c.cycle_base = true,
    );
    dispatcher.add_event(
        KeyEventKind::CharKeyPress,
        Some(KeyCode::Escape),
        CONTROLS,
        |c, _| c.quit = true,
    );
}

/// One layer per `config.layers` entry, ids numbered from 1 in order.
pub fn layers_from_config(config: &Config, pool: &Arc<TileWorkerPool>) -> Vec<Layer> {
    config
        .layers
        .iter()
        .enumerate()
        .map(|(i, lc)| {
            let provider: Arc<dyn TileProvider> = Arc::new(ProceduralProvider::new(
                TileSource::Imagery(lc.source),
                Arc::clone(pool),
            ));
            Layer::new(LayerId(i as u32 + 1), lc.name.clone(), provider)
                .with_visibility(lc.visible)
                .with_opacity(lc.opacity)
                .with_z_index(lc.z_index)
                .with_base(lc.base)
                .with_tint(lc.tint)
        })
        .collect()
}

/// The base layer after the active one, in id order, wrapping around.
pub fn next_base_layer(planet: &Planet) -> Option<LayerId> {
    let mut bases: Vec<LayerId> = planet
        .layers()
        .iter()
        .filter(|l| l.is_base_layer())
        .map(Layer::id)
        .collect();
    bases.sort();
    let current = planet.layers().base_layer().map(Layer::id);
    let next = match current.and_then(|id| bases.iter().position(|b| *b == id)) {
        Some(i) => bases.get((i + 1) % bases.len()),
        None => bases.first(),
    };
    next.copied().filter(|id| Some(*id) != current)
}

/// The height factor after `current` in [`HEIGHT_FACTORS`].
pub fn next_height_factor(current: f64) -> f64 {
    HEIGHT_FACTORS
        .iter()
        .copied()
        .find(|f| *f > current + 1e-9)
        .unwrap_or(HEIGHT_FACTORS[0])
}

fn window_attributes(config: &Config) -> WindowAttributes {
    let attrs = WindowAttributes::default()
        .with_title(config.window.title.clone())
        .with_inner_size(winit::dpi::LogicalSize::new(
            f64::from(config.window.width),
            f64::from(config.window.height),
        ));
    if config.window.fullscreen {
        attrs.with_fullscreen(Some(Fullscreen::Borderless(None)))
    } else {
        attrs
    }
}

/// Application state driven by the winit event loop.
pub struct Viewer {
    config: Config,
    window: Option<Arc<Window>>,
    gpu: Option<WgpuContext>,
    planet: Planet,
    camera: OrbitCamera,
    keyboard: KeyboardDispatcher<Controls>,
    controls: Controls,
    mouse: MouseState,
    drag_px: f32,
    clock: FrameClock,
    pool: Arc<TileWorkerPool>,
    terrain_enabled: bool,
    fatal: Option<ViewerError>,
}

impl Viewer {
    pub fn new(config: Config) -> Result<Self, ViewerError> {
        let pool = Arc::new(TileWorkerPool::with_defaults()?);
        let mut planet = Planet::from_config("earth", &config)?;
        let added = planet.add_layers(layers_from_config(&config, &pool));
        info!(
            layers = added,
            workers = pool.thread_count(),
            "Viewer configured"
        );

        let mut keyboard = KeyboardDispatcher::new();
        bind_controls(&mut keyboard);

        Ok(Self {
            camera: OrbitCamera::from_config(&config.camera),
            config,
            window: None,
            gpu: None,
            planet,
            keyboard,
            controls: Controls::default(),
            mouse: MouseState::new(),
            drag_px: 0.0,
            clock: FrameClock::new(),
            pool,
            terrain_enabled: false,
            fatal: None,
        })
    }

    /// Keep the first error that stopped the event loop.
    fn record_fatal(&mut self, err: ViewerError) {
        error!("{err}");
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: impl Into<ViewerError>) {
        self.record_fatal(err.into());
        event_loop.exit();
    }

    /// Outcome of the run once the event loop has returned.
    fn finish(&mut self) -> Result<(), ViewerError> {
        self.fatal.take().map_or(Ok(()), Err)
    }

    fn viewport(&self) -> (u32, u32) {
        self.gpu
            .as_ref()
            .map(WgpuContext::surface_size)
            .unwrap_or((self.config.window.width, self.config.window.height))
    }

    fn set_terrain(&mut self, enabled: bool) {
        self.terrain_enabled = enabled;
        let provider = enabled.then(|| {
            Arc::new(ProceduralProvider::new(
                TileSource::Terrain {
                    amplitude_m: TERRAIN_AMPLITUDE_M,
                },
                Arc::clone(&self.pool),
            )) as Arc<dyn TileProvider>
        });
        self.planet.set_terrain_provider(provider);
        info!(enabled, "Terrain toggled");
    }

    /// Apply one-shot keyboard requests. Returns `false` when asked to quit.
    fn apply_requests(&mut self, controls: &Controls) -> bool {
        if controls.toggle_terrain {
            self.set_terrain(!self.terrain_enabled);
        }
        if controls.next_height_factor {
            let factor = next_height_factor(self.planet.height_factor());
            self.planet.set_height_factor(factor);
            info!(factor, "Height factor changed");
        }
        if controls.cycle_base
            && let Some(id) = next_base_layer(&self.planet)
        {
            self.planet.set_base_layer(id);
            info!(?id, "Base layer changed");
        }
        !controls.quit
    }

    fn update_camera(&mut self, controls: &Controls) {
        let viewport = self.viewport();
        if self.mouse.is_pressed(MouseButton::Left) {
            let delta = self.mouse.delta();
            self.drag_px += delta.length();
            if delta != Vec2::ZERO {
                self.camera
                    .drag(delta, self.planet.ellipsoid(), viewport.1);
            }
        }
        let scroll = self.mouse.scroll();
        if scroll != 0.0 {
            self.camera.zoom(f64::from(scroll) * 0.25);
        }

        let camera = &mut self.camera;
        self.clock.tick(|dt| {
            let rate = camera.orbit_rate_deg_s() * dt;
            camera.orbit(f64::from(controls.orbit.x) * rate, f64::from(controls.orbit.y) * rate);
            camera.zoom(f64::from(controls.zoom) * dt);
        });
    }

    fn log_pick(&mut self) {
        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };
        let p = self.mouse.position();
        if p.x < 0.0 || p.y < 0.0 {
            return;
        }
        match self.planet.pick(gpu, p.x as u32, p.y as u32) {
            Ok(Some(hit)) => {
                let (lon, lat, h) = hit.geodetic;
                info!(
                    segment = hit.segment.get(),
                    depth = hit.depth,
                    "Picked tile at {lon:.4}, {lat:.4} ({h:.0} m)"
                );
                if self.config.debug.show_picking_buffer
                    && let Some(window) = &self.window
                {
                    window.set_title(&format!(
                        "{} [segment {} depth {}]",
                        self.config.window.title, hit.segment.get(), hit.depth
                    ));
                }
            }
            Ok(None) => debug!("Nothing under the cursor"),
            Err(e) => warn!("Pick failed: {e}"),
        }
    }

    #[instrument(skip_all)]
    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        self.keyboard.handle_events(&mut self.controls);
        let controls = self.controls.take_frame();
        if !self.apply_requests(&controls) {
            info!("Quit requested");
            event_loop.exit();
            return;
        }
        self.update_camera(&controls);

        let clicked = self.mouse.just_released(MouseButton::Left) && self.drag_px < CLICK_SLOP_PX;
        if self.mouse.just_released(MouseButton::Left) {
            self.drag_px = 0.0;
        }

        let viewport = self.viewport();
        let mouse = self
            .mouse
            .cursor_in_window()
            .then(|| self.mouse.position());
        let frame = self
            .camera
            .frame_state(self.planet.ellipsoid(), viewport, mouse);

        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };
        let result = self.planet.frame(gpu, &frame).and_then(|stats| {
            gpu.end_frame()?;
            Ok(stats)
        });
        match result {
            Ok(stats) => {
                if stats.frame_index % 300 == 0 {
                    debug!(
                        frame = stats.frame_index,
                        rendered = stats.rendered_nodes,
                        segments = stats.live_segments,
                        pending = self.pool.in_flight_count(),
                        altitude = stats.camera_altitude,
                        "Frame stats"
                    );
                }
            }
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        }

        if clicked || (self.config.debug.show_picking_buffer && mouse.is_some()) {
            self.log_pick();
        }
        self.mouse.clear_transients();
    }
}

impl ApplicationHandler for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let window = match event_loop.create_window(window_attributes(&self.config)) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        };

        let mut gpu = match WgpuContext::new(Arc::clone(&window), self.config.window.vsync) {
            Ok(gpu) => gpu,
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        };
        let size = gpu.surface_size();
        info!("Surface initialized: {}x{}", size.0, size.1);

        if let Err(e) = self.planet.init(&mut gpu) {
            self.fail(event_loop, e);
            return;
        }

        self.gpu = Some(gpu);
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if size.width > 0
                    && size.height > 0
                    && let Some(gpu) = &mut self.gpu
                {
                    gpu.resize(size.width, size.height);
                    debug!("Resized to {}x{}", size.width, size.height);
                }
            }
            WindowEvent::Focused(false) => self.keyboard.release_keys(),
            WindowEvent::KeyboardInput { event, .. } => {
                self.keyboard.process_event(&mut self.controls, &event);
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.mouse.on_cursor_moved(position.x, position.y);
            }
            WindowEvent::CursorLeft { .. } => self.mouse.on_cursor_left(),
            WindowEvent::MouseInput { state, button, .. } => {
                if button == MouseButton::Left && state == ElementState::Pressed {
                    self.drag_px = 0.0;
                }
                self.mouse.on_button(button, state);
            }
            WindowEvent::MouseWheel { delta, .. } => self.mouse.on_scroll(delta),
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(gpu) = self.gpu.as_mut() {
            self.planet.destroy(gpu);
        }
        info!("Viewer stopped after {} frames", self.clock.frame_count());
    }
}

/// Open the viewer window and block until it closes. Fails with the error
/// that stopped the loop, if any.
pub fn run(config: Config) -> Result<(), ViewerError> {
    let event_loop = EventLoop::new()?;
    let mut viewer = Viewer::new(config)?;
    event_loop.run_app(&mut viewer)?;
    viewer.finish()
}
