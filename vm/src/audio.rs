//! Synthetic audio-analysis data sources
//!
//! Deterministic stand-ins for an analyser node, derived from the host clock
//! so that revisions reading `audio-volume` behave the same on every run.

use std::f64::consts::TAU;
use std::rc::Rc;

use crate::capability::DataSource;
use crate::event_loop::EventLoop;
use crate::value::Value;

pub const BAND_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Volume,
    Bass,
    Bands,
}

pub struct SyntheticAudio {
    clock: Rc<EventLoop>,
    channel: Channel,
}

fn wave(seconds: f64, hz: f64) -> f64 {
    0.5 + 0.5 * (seconds * hz * TAU).sin()
}

impl SyntheticAudio {
    /// `audio-volume`, `audio-bass` and `audio-bands`
    pub fn sources(clock: &Rc<EventLoop>) -> Vec<Rc<dyn DataSource>> {
        [Channel::Volume, Channel::Bass, Channel::Bands]
            .into_iter()
            .map(|channel| {
                Rc::new(SyntheticAudio {
                    clock: clock.clone(),
                    channel,
                }) as Rc<dyn DataSource>
            })
            .collect()
    }
}

impl DataSource for SyntheticAudio {
    fn name(&self) -> &str {
        match self.channel {
            Channel::Volume => "audio-volume",
            Channel::Bass => "audio-bass",
            Channel::Bands => "audio-bands",
        }
    }

    fn sample(&self) -> Result<Value, String> {
        let t = self.clock.now().as_secs_f64();
        Ok(match self.channel {
            Channel::Volume => Value::Float(wave(t, 0.5)),
            Channel::Bass => Value::Float(wave(t, 2.0)),
            Channel::Bands => Value::Vector(
                (0..BAND_COUNT)
                    .map(|band| Value::Float(wave(t, 0.25 * (band + 1) as f64)))
                    .collect(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sources_follow_clock() {
        let clock = Rc::new(EventLoop::new());
        let sources = SyntheticAudio::sources(&clock);
        let names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["audio-volume", "audio-bass", "audio-bands"]);

        assert_eq!(sources[0].sample().unwrap(), Value::Float(0.5));
        clock.tick(Duration::from_millis(500));
        match sources[0].sample().unwrap() {
            Value::Float(v) => assert!((v - 1.0).abs() < 1e-9),
            other => panic!("Expected float, got {:?}", other),
        }
        match sources[2].sample().unwrap() {
            Value::Vector(bands) => assert_eq!(bands.len(), BAND_COUNT),
            other => panic!("Expected vector, got {:?}", other),
        }
    }
}
