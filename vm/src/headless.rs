//! Headless reference peripheral
//!
//! Records drawing commands into a per-frame display list instead of
//! rasterizing them. Used by the development host and the tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use crate::capability::{arg_callable, arg_number, arg_string, Capability, Peripheral, Reply};
use crate::config::Limits;
use crate::evaluator::call_isolated;
use crate::protocol::{StatusBus, StatusReport};
use crate::value::Value;

/// One recorded drawing command
#[derive(Debug, Clone, PartialEq)]
pub struct DrawOp {
    pub layer: String,
    pub command: String,
    pub args: Vec<Value>,
}

type FrameBuffer = Rc<RefCell<Vec<DrawOp>>>;

fn frame_args(frame: u64, time: Duration) -> Vec<Value> {
    vec![Value::Int(frame as i64), Value::Float(time.as_secs_f64())]
}

/// A named drawing surface with its own callbacks
pub struct HeadlessLayer {
    name: String,
    draw: RefCell<Option<Value>>,
    on_frame: RefCell<Vec<Value>>,
    opacity: Cell<f64>,
    visible: Cell<bool>,
    frame: FrameBuffer,
    limits: Limits,
}

impl HeadlessLayer {
    fn new(name: &str, frame: FrameBuffer, limits: Limits) -> Self {
        Self {
            name: name.to_string(),
            draw: RefCell::new(None),
            on_frame: RefCell::new(Vec::new()),
            opacity: Cell::new(1.0),
            visible: Cell::new(true),
            frame,
            limits,
        }
    }

    pub fn layer_name(&self) -> &str {
        &self.name
    }

    pub fn opacity(&self) -> f64 {
        self.opacity.get()
    }

    pub fn callback_count(&self) -> usize {
        usize::from(self.draw.borrow().is_some()) + self.on_frame.borrow().len()
    }

    fn record(&self, command: &str, args: Vec<Value>) {
        if self.visible.get() {
            self.frame.borrow_mut().push(DrawOp {
                layer: self.name.clone(),
                command: command.to_string(),
                args,
            });
        }
    }

    fn shape(&self, command: &str, args: Vec<Value>, numbers: usize) -> Result<Reply, String> {
        for index in 0..numbers {
            arg_number(command, &args, index)?;
        }
        self.record(command, args);
        Ok(Value::Nil.into())
    }

    fn render(&self, frame: u64, time: Duration) {
        if !self.visible.get() {
            return;
        }
        let mut callbacks: Vec<Value> = self.draw.borrow().iter().cloned().collect();
        callbacks.extend(self.on_frame.borrow().iter().cloned());
        for callback in callbacks {
            if let Err(e) = call_isolated(&callback, frame_args(frame, time), self.limits) {
                log::warn!("frame callback on layer '{}' failed: {}", self.name, e);
            }
        }
    }
}

impl Capability for HeadlessLayer {
    fn name(&self) -> &str {
        "layer"
    }

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, String> {
        match method {
            "draw" => {
                let callback = arg_callable(method, &args, 0)?;
                *self.draw.borrow_mut() = Some(callback);
                Ok(Value::Nil.into())
            }
            "on-frame" => {
                let callback = arg_callable(method, &args, 0)?;
                self.on_frame.borrow_mut().push(callback);
                Ok(Value::Nil.into())
            }
            "rect" => self.shape(method, args, 4),
            "circle" => self.shape(method, args, 3),
            "line" => self.shape(method, args, 4),
            "text" => {
                arg_string(method, &args, 0)?;
                arg_number(method, &args, 1)?;
                arg_number(method, &args, 2)?;
                self.record(method, args);
                Ok(Value::Nil.into())
            }
            "background" => {
                if args.is_empty() {
                    return Err("background expects a color".to_string());
                }
                self.record(method, args);
                Ok(Value::Nil.into())
            }
            "opacity" => {
                if !args.is_empty() {
                    let opacity = arg_number(method, &args, 0)?;
                    self.opacity.set(opacity.clamp(0.0, 1.0));
                }
                Ok(Value::Float(self.opacity.get()).into())
            }
            "hide" => {
                self.visible.set(false);
                Ok(Value::Nil.into())
            }
            "show" => {
                self.visible.set(true);
                Ok(Value::Nil.into())
            }
            "name" => Ok(Value::Str(self.name.clone()).into()),
            _ => Err(format!("unknown method '{}' for layer", method)),
        }
    }

    fn clear_frame_callbacks(&self) {
        *self.draw.borrow_mut() = None;
        self.on_frame.borrow_mut().clear();
    }
}

enum Param {
    Fixed(Value),
    /// Re-evaluated every frame with the elapsed time
    Deferred(Value),
}

#[derive(Default)]
struct Clock {
    paused: bool,
    rendering: bool,
    frame_count: u64,
    elapsed: Duration,
    last_now: Option<Duration>,
}

pub struct HeadlessPeripheral {
    width: u32,
    height: u32,
    root: HeadlessLayer,
    layers: RefCell<Vec<Rc<HeadlessLayer>>>,
    /// Layers created by the host; survive `reset_sub_objects`
    base_layers: Cell<usize>,
    clock: RefCell<Clock>,
    params: RefCell<BTreeMap<String, Param>>,
    resolved: RefCell<BTreeMap<String, Value>>,
    frame: FrameBuffer,
    last_frame: RefCell<Vec<DrawOp>>,
    bus: Rc<StatusBus>,
    limits: Limits,
}

impl HeadlessPeripheral {
    pub fn new(width: u32, height: u32, bus: Rc<StatusBus>) -> Self {
        Self::with_limits(width, height, bus, Limits::default())
    }

    pub fn with_limits(width: u32, height: u32, bus: Rc<StatusBus>, limits: Limits) -> Self {
        let frame: FrameBuffer = Rc::new(RefCell::new(Vec::new()));
        Self {
            width,
            height,
            root: HeadlessLayer::new("main", frame.clone(), limits),
            layers: RefCell::new(Vec::new()),
            base_layers: Cell::new(0),
            clock: RefCell::new(Clock::default()),
            params: RefCell::new(BTreeMap::new()),
            resolved: RefCell::new(BTreeMap::new()),
            frame,
            last_frame: RefCell::new(Vec::new()),
            bus,
            limits,
        }
    }

    /// Add a layer owned by the host rather than by user code
    pub fn add_base_layer(&self, name: &str) -> Rc<HeadlessLayer> {
        let layer = self.create_layer(name);
        let mut layers = self.layers.borrow_mut();
        let base = self.base_layers.get();
        layers.insert(base, layer.clone());
        self.base_layers.set(base + 1);
        layer
    }

    fn create_layer(&self, name: &str) -> Rc<HeadlessLayer> {
        Rc::new(HeadlessLayer::new(name, self.frame.clone(), self.limits))
    }

    fn find_layer(&self, name: &str) -> Option<Rc<HeadlessLayer>> {
        self.layers
            .borrow()
            .iter()
            .find(|layer| layer.name == name)
            .cloned()
    }

    /// The display list of the most recent frame that drew anything
    pub fn last_frame(&self) -> Vec<DrawOp> {
        self.last_frame.borrow().clone()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.borrow().len()
    }

    pub fn param(&self, name: &str) -> Option<Value> {
        self.resolved.borrow().get(name).cloned()
    }

    /// Registered frame callbacks across the root and every layer
    pub fn callback_count(&self) -> usize {
        self.root.callback_count()
            + self
                .layers
                .borrow()
                .iter()
                .map(|layer| layer.callback_count())
                .sum::<usize>()
    }

    fn resolve_params(&self, time: Duration) {
        let deferred: Vec<(String, Value)> = self
            .params
            .borrow()
            .iter()
            .filter_map(|(name, param)| match param {
                Param::Deferred(f) => Some((name.clone(), f.clone())),
                Param::Fixed(_) => None,
            })
            .collect();

        for (name, f) in deferred {
            match call_isolated(&f, vec![Value::Float(time.as_secs_f64())], self.limits) {
                Ok(value) => {
                    self.resolved.borrow_mut().insert(name, value);
                }
                Err(e) => {
                    // A failing parameter is pinned to its last value and reported once
                    log::warn!("deferred parameter '{}' failed, pinning it: {}", name, e);
                    let last = self.resolved.borrow().get(&name).cloned().unwrap_or(Value::Nil);
                    self.params.borrow_mut().insert(name.clone(), Param::Fixed(last));
                    self.bus.emit(StatusReport::SoftError {
                        source: format!("param:{}", name),
                        message: e.message,
                    });
                }
            }
        }
    }
}

impl Capability for HeadlessPeripheral {
    fn name(&self) -> &str {
        "canvas"
    }

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, String> {
        match method {
            "add-layer" => {
                let name = arg_string(method, &args, 0)?;
                let layer = self.create_layer(&name);
                self.layers.borrow_mut().push(layer.clone());
                Ok(Reply::Object(layer))
            }
            "layer" => {
                let name = arg_string(method, &args, 0)?;
                self.find_layer(&name)
                    .map(|layer| Reply::Object(layer as Rc<dyn Capability>))
                    .ok_or_else(|| format!("no layer named '{}'", name))
            }
            "layer-count" => Ok(Value::Int(self.layer_count() as i64).into()),
            "frame-count" => Ok(Value::Int(self.frame_count() as i64).into()),
            "time" => Ok(Value::Float(self.elapsed().as_secs_f64()).into()),
            "width" => Ok(Value::Int(self.width as i64).into()),
            "height" => Ok(Value::Int(self.height as i64).into()),
            "set" => {
                let name = arg_string(method, &args, 0)?;
                let value = args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| "set expects a name and a value".to_string())?;
                if value.is_callable() {
                    self.params.borrow_mut().insert(name, Param::Deferred(value));
                } else {
                    self.resolved.borrow_mut().insert(name.clone(), value.clone());
                    self.params.borrow_mut().insert(name, Param::Fixed(value));
                }
                Ok(Value::Nil.into())
            }
            "param" => {
                let name = arg_string(method, &args, 0)?;
                Ok(self.param(&name).unwrap_or(Value::Nil).into())
            }
            _ => self.root.call(method, args),
        }
    }

    fn clear_frame_callbacks(&self) {
        self.root.clear_frame_callbacks();
        // Deferred parameters keep their last resolved value
        let mut params = self.params.borrow_mut();
        let resolved = self.resolved.borrow();
        for (name, param) in params.iter_mut() {
            if let Param::Deferred(_) = param {
                *param = Param::Fixed(resolved.get(name).cloned().unwrap_or(Value::Nil));
            }
        }
    }
}

impl Peripheral for HeadlessPeripheral {
    fn pause(&self) {
        self.clock.borrow_mut().paused = true;
    }

    fn resume(&self) {
        self.clock.borrow_mut().paused = false;
    }

    fn is_paused(&self) -> bool {
        self.clock.borrow().paused
    }

    fn is_rendering(&self) -> bool {
        self.clock.borrow().rendering
    }

    fn reset_clock(&self) {
        let mut clock = self.clock.borrow_mut();
        clock.frame_count = 0;
        clock.elapsed = Duration::ZERO;
        clock.last_now = None;
    }

    fn render_frame(&self, now: Duration) {
        let (frame, time) = {
            let mut clock = self.clock.borrow_mut();
            if clock.paused || clock.rendering {
                return;
            }
            let delta = clock
                .last_now
                .map(|last| now.saturating_sub(last))
                .unwrap_or(Duration::ZERO);
            clock.last_now = Some(now);
            clock.elapsed += delta;
            clock.frame_count += 1;
            clock.rendering = true;
            (clock.frame_count, clock.elapsed)
        };

        self.resolve_params(time);
        self.root.render(frame, time);
        let layers: Vec<Rc<HeadlessLayer>> = self.layers.borrow().clone();
        for layer in layers {
            layer.render(frame, time);
        }

        self.clock.borrow_mut().rendering = false;
        let drawn = std::mem::take(&mut *self.frame.borrow_mut());
        if !drawn.is_empty() {
            *self.last_frame.borrow_mut() = drawn;
        }
    }

    fn frame_count(&self) -> u64 {
        self.clock.borrow().frame_count
    }

    fn elapsed(&self) -> Duration {
        self.clock.borrow().elapsed
    }

    fn sub_objects(&self) -> Vec<Rc<dyn Capability>> {
        self.layers
            .borrow()
            .iter()
            .map(|layer| layer.clone() as Rc<dyn Capability>)
            .collect()
    }

    fn reset_sub_objects(&self) {
        let base = self.base_layers.get();
        self.layers.borrow_mut().truncate(base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::object_value;

    const FRAME: Duration = Duration::from_millis(16);

    fn peripheral() -> (Rc<HeadlessPeripheral>, Rc<RefCell<Vec<StatusReport>>>) {
        let bus = Rc::new(StatusBus::new());
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        bus.subscribe(move |r| sink.borrow_mut().push(r.clone()));
        (Rc::new(HeadlessPeripheral::new(320, 240, bus)), reports)
    }

    fn send(target: &Value, message: &[Value]) -> Result<Value, String> {
        match target {
            Value::NativeFunction(f) => f(message),
            other => panic!("Expected capability object, got {:?}", other),
        }
    }

    #[test]
    fn test_draw_callback_records_frame() {
        let (canvas, _) = peripheral();
        let object = object_value(canvas.clone());
        let handle = object.clone();
        let draw = Value::native(move |args| {
            send(&handle, &[Value::keyword("rect"), args[0].clone(), Value::Int(0), Value::Int(10), Value::Int(10)])
        });
        send(&object, &[Value::keyword("draw"), draw]).unwrap();

        canvas.render_frame(FRAME);
        canvas.render_frame(FRAME * 2);
        assert_eq!(canvas.frame_count(), 2);
        assert_eq!(canvas.elapsed(), FRAME);
        let frame = canvas.last_frame();
        assert_eq!(frame.len(), 1);
        assert_eq!(frame[0].layer, "main");
        assert_eq!(frame[0].args[0], Value::Int(2));
    }

    #[test]
    fn test_paused_peripheral_does_not_render() {
        let (canvas, _) = peripheral();
        canvas.pause();
        canvas.render_frame(FRAME);
        assert_eq!(canvas.frame_count(), 0);
        canvas.resume();
        canvas.render_frame(FRAME);
        assert_eq!(canvas.frame_count(), 1);
        canvas.reset_clock();
        assert_eq!(canvas.frame_count(), 0);
        assert_eq!(canvas.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_layers_and_reset() {
        let (canvas, _) = peripheral();
        canvas.add_base_layer("hud");
        let object = object_value(canvas.clone());
        let layer = send(&object, &[Value::keyword("add-layer"), Value::Str("fx".into())]).unwrap();
        send(&layer, &[Value::keyword("draw"), Value::native(|_| Ok(Value::Nil))]).unwrap();
        assert_eq!(send(&layer, &[Value::keyword("opacity"), Value::Float(2.0)]).unwrap(), Value::Float(1.0));
        assert_eq!(canvas.layer_count(), 2);
        assert_eq!(canvas.callback_count(), 1);

        for sub in canvas.sub_objects() {
            sub.clear_frame_callbacks();
        }
        assert_eq!(canvas.callback_count(), 0);
        canvas.reset_sub_objects();
        assert_eq!(canvas.layer_count(), 1);
        assert!(send(&object, &[Value::keyword("layer"), Value::Str("hud".into())]).is_ok());
        assert!(send(&object, &[Value::keyword("layer"), Value::Str("fx".into())]).is_err());
    }

    #[test]
    fn test_deferred_param_failure_is_soft_error() {
        let (canvas, reports) = peripheral();
        let object = object_value(canvas.clone());
        send(&object, &[Value::keyword("set"), Value::keyword("hue"), Value::native(|args| Ok(args[0].clone()))]).unwrap();
        send(&object, &[Value::keyword("set"), Value::keyword("bad"), Value::native(|_| Err("no hue".to_string()))]).unwrap();
        send(&object, &[Value::keyword("set"), Value::keyword("size"), Value::Int(3)]).unwrap();

        canvas.render_frame(FRAME);
        canvas.render_frame(FRAME * 2);
        canvas.render_frame(FRAME * 3);
        assert_eq!(canvas.param("hue"), Some(Value::Float(0.032)));
        assert_eq!(canvas.param("size"), Some(Value::Int(3)));
        assert_eq!(canvas.param("bad"), None);
        assert_eq!(
            *reports.borrow(),
            vec![StatusReport::SoftError {
                source: "param:bad".to_string(),
                message: "no hue".to_string(),
            }]
        );
    }

    #[test]
    fn test_frozen_output_survives_empty_frames() {
        let (canvas, _) = peripheral();
        let object = object_value(canvas.clone());
        send(&object, &[Value::keyword("rect"), Value::Int(0), Value::Int(0), Value::Int(1), Value::Int(1)]).unwrap();
        canvas.render_frame(FRAME);
        send(&object, &[Value::keyword("circle"), Value::Int(1), Value::Int(1), Value::Int(1)]).unwrap();
        canvas.render_frame(FRAME * 2);
        assert_eq!(canvas.last_frame()[0].command, "circle");
        canvas.render_frame(FRAME * 3);
        assert_eq!(canvas.last_frame()[0].command, "circle");
    }
}
