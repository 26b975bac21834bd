//! Housekeeping ADC channels and the background sampling thread

use crate::chip::Labeled;
use crate::interconnect::Interconnect;
use crate::model::SensorModel;
use kstring::KString;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::debug;

/// Sliding retention window for channel samples, in seconds
const WINDOW_S: f64 = 15.0;

/// One calibrated housekeeping channel with a sliding sample window
#[derive(Debug, Clone)]
pub struct AdcChannel {
    pub label: KString,
    pub device_id: u32,
    pub channel: u32,
    pub offset: f64,
    pub slope: f64,
    pub enabled: bool,
    samples: VecDeque<(f64, f64)>,
}

impl AdcChannel {
    #[must_use]
    pub fn new(label: KString, device_id: u32, channel: u32, offset: f64, slope: f64) -> Self {
        Self {
            label,
            device_id,
            channel,
            offset,
            slope,
            enabled: true,
            samples: VecDeque::new(),
        }
    }

    /// Append one raw reading at time `t` (seconds), applying the linear
    /// calibration. Unless `keep_all` is set, the oldest sample is dropped
    /// once the newest timestamp runs past the window.
    pub fn add_sample(&mut self, t: f64, raw: u16, keep_all: bool) {
        let y = f64::from(raw) * self.slope + self.offset;
        self.samples.push_back((t, y));
        if !keep_all {
            if let Some(&(oldest, _)) = self.samples.front() {
                if t > oldest + WINDOW_S {
                    self.samples.pop_front();
                }
            }
        }
    }

    /// The retained (t, y) samples, oldest first
    #[must_use]
    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.samples.iter().copied()
    }

    pub fn reset_samples(&mut self) {
        self.samples.clear();
    }
}

impl Labeled for AdcChannel {
    fn label(&self) -> &str {
        &self.label
    }
}

/// At most one background thread sweeping every enabled channel
pub struct AdcSampler<I> {
    model: Arc<SensorModel<I>>,
    run: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<I> AdcSampler<I>
where
    I: Interconnect + Send + 'static,
{
    #[must_use]
    pub fn new(model: Arc<SensorModel<I>>) -> Self {
        Self {
            model,
            run: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Start sweeping. Clears retained samples; a no-op while running.
    pub fn start(&self) {
        let mut slot = match self.worker.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.model.reset_adc_samples();
        self.run.store(true, Ordering::SeqCst);
        let model = Arc::clone(&self.model);
        let run = Arc::clone(&self.run);
        *slot = Some(std::thread::spawn(move || {
            let t0 = Instant::now();
            while run.load(Ordering::SeqCst) {
                model.sample_adcs(t0.elapsed().as_secs_f64());
                if run.load(Ordering::SeqCst) {
                    std::thread::sleep(model.adc_interval());
                }
            }
            debug!("adc sampler finished");
        }));
    }

    /// Request a stop and wait for the in-flight sweep to finish
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
        let handle = {
            let mut slot = match self.worker.lock() {
                Ok(s) => s,
                Err(p) => p.into_inner(),
            };
            slot.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        let slot = match self.worker.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        slot.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl<I> Drop for AdcSampler<I> {
    fn drop(&mut self) {
        self.run.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_transform_applies() {
        let mut ch = AdcChannel::new("VDD".into(), 0, 1, 0.5, 2.0);
        ch.add_sample(0.0, 3, false);
        let (_, y) = ch.samples().next().unwrap();
        assert!((y - 6.5).abs() < f64::EPSILON);
    }

    #[test]
    fn window_evicts_the_oldest_sample() {
        let mut ch = AdcChannel::new("VDD".into(), 0, 1, 0.0, 1.0);
        ch.add_sample(0.0, 1, false);
        ch.add_sample(5.0, 2, false);
        ch.add_sample(16.0, 3, false);
        let times: Vec<f64> = ch.samples().map(|(t, _)| t).collect();
        assert_eq!(times, vec![5.0, 16.0]);
    }

    #[test]
    fn keep_all_disables_eviction() {
        let mut ch = AdcChannel::new("VDD".into(), 0, 1, 0.0, 1.0);
        ch.add_sample(0.0, 1, true);
        ch.add_sample(20.0, 2, true);
        assert_eq!(ch.samples().count(), 2);
    }

    #[test]
    fn reset_clears_the_window() {
        let mut ch = AdcChannel::new("VDD".into(), 0, 1, 0.0, 1.0);
        ch.add_sample(0.0, 1, false);
        ch.reset_samples();
        assert_eq!(ch.samples().count(), 0);
    }

    #[test]
    fn sampler_sweeps_until_stopped() {
        use crate::actions::{wait_until, ProtocolActions};
        use crate::link::DeviceLink;
        use crate::registers::{adc_data, trig_out};
        use crate::serial::StandardFramer;
        use crate::session::{DeviceInfo, Session};
        use std::time::Duration;

        let mock = crate::interconnect::mock::Mock::new();
        let session = Arc::new(Session::new());
        session.attach(mock.clone(), DeviceInfo::default()).unwrap();
        mock.auto_trigger_out(trig_out::ADDR, trig_out::ADC_DATA_VALID.mask());
        mock.script_wire_out(adc_data::ADDR, 0x0AA);

        let mut config = crate::config::tests::minimal();
        config.adcs = vec![crate::config::AdcDef {
            label: "VDD".into(),
            device_id: 0,
            channel: 1,
            offset: 0.0,
            slope: 1.0,
        }];
        let actions = ProtocolActions::new(DeviceLink::new(session));
        let model =
            Arc::new(SensorModel::new(&config, actions, Box::new(StandardFramer)).unwrap());

        let sampler = AdcSampler::new(Arc::clone(&model));
        sampler.start();
        // Starting again while the sweep runs is a no-op
        sampler.start();
        assert!(wait_until(
            || {
                model.with_adcs(|bank| {
                    bank.get("VDD").is_some_and(|c| c.samples().count() >= 2)
                })
            },
            Duration::from_secs(5),
            Duration::from_millis(5),
        ));
        sampler.stop();
        assert!(!sampler.is_running());

        let settled = model.with_adcs(|bank| {
            bank.get("VDD").map(|c| c.samples().count()).unwrap_or(0)
        });
        std::thread::sleep(Duration::from_millis(30));
        let after = model.with_adcs(|bank| {
            bank.get("VDD").map(|c| c.samples().count()).unwrap_or(0)
        });
        assert_eq!(after, settled);
        model.with_adcs(|bank| {
            let (_, y) = bank.get("VDD").unwrap().samples().next().unwrap();
            assert!((y - f64::from(0x0AAu16)).abs() < f64::EPSILON);
        });
    }
}
