// src/keybind.rs
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::reader::BciInput;

/// Named actions bound to channels, plus axes built from opposing actions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeybindMap {
    actions: HashMap<String, usize>,
    /// axis name -> (negative action, positive action)
    axes: HashMap<String, (String, String)>,
}

impl KeybindMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steering on channels 2/1, throttle on 0 with reverse on 3.
    pub fn car() -> Self {
        let mut map = Self::new();
        map.bind("steer_left", 2);
        map.bind("steer_right", 1);
        map.bind("forward", 0);
        map.bind("backward", 3);
        map.bind_axis("Horizontal", "steer_left", "steer_right");
        map.bind_axis("Vertical", "backward", "forward");
        map
    }

    pub fn bind(&mut self, action: impl Into<String>, channel: usize) {
        self.actions.insert(action.into(), channel);
    }

    pub fn unbind(&mut self, action: &str) -> Option<usize> {
        self.actions.remove(action)
    }

    pub fn bind_axis(
        &mut self,
        axis: impl Into<String>,
        negative: impl Into<String>,
        positive: impl Into<String>,
    ) {
        self.axes.insert(axis.into(), (negative.into(), positive.into()));
    }

    pub fn channel(&self, action: &str) -> Option<usize> {
        self.actions.get(action).copied()
    }

    /// Unbound actions are never pressed.
    pub fn pressed(&self, input: &dyn BciInput, action: &str) -> bool {
        self.channel(action).map_or(false, |c| input.read_bool(c))
    }

    pub fn strength(&self, input: &dyn BciInput, action: &str) -> f64 {
        self.channel(action).map_or(0.0, |c| input.read_numeric(c))
    }

    /// -1, 0 or 1. Both or neither side pressed reads as 0.
    pub fn axis(&self, input: &dyn BciInput, axis: &str) -> i8 {
        let Some((negative, positive)) = self.axes.get(axis) else {
            return 0;
        };
        match (self.pressed(input, negative), self.pressed(input, positive)) {
            (true, false) => -1,
            (false, true) => 1,
            _ => 0,
        }
    }
}
