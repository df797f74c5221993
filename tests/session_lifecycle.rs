//! Session open/close, parameter push and broadcast behaviour against the
//! simulated instrument.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use picodaq::session::{Fanout, HandleId, SessionState, StreamHooks};
use picodaq::transport::{MockConnector, MockDevice};
use picodaq::{
    DaqError, OutputPayload, Polarity, PortRegistry, SampleSource, Session, Settings, StreamSpec,
};

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.link.command_timeout_ms = 100;
    settings
}

fn session(device: &MockDevice, registry: &PortRegistry) -> Session {
    Session::new(
        "mock0",
        MockConnector::new(device.clone()),
        registry.clone(),
        settings(),
    )
}

#[test]
fn test_second_session_on_same_port_is_refused() {
    let device = MockDevice::new();
    let registry = PortRegistry::new();
    let mut first = session(&device, &registry);
    let mut second = session(&device, &registry);

    let ai = first.open(StreamSpec::analog_in([0])).unwrap();
    let err = second.open(StreamSpec::analog_in([0])).unwrap_err();
    assert!(matches!(err, DaqError::Connection(_)));
    assert!(err.to_string().contains("already exists"));
    assert_eq!(second.state(), SessionState::Closed);

    first.close(ai).unwrap();
    assert!(registry.is_available("mock0"));
    assert!(second.open(StreamSpec::analog_in([0])).is_ok());
}

#[test]
fn test_absent_device_leaves_port_free() {
    let device = MockDevice::new();
    device.set_present(false);
    let registry = PortRegistry::new();
    let mut session = session(&device, &registry);

    let err = session.open(StreamSpec::analog_in([0])).unwrap_err();
    assert!(matches!(err, DaqError::Connection(_)));
    assert!(registry.is_available("mock0"));
    assert!(session.handles().is_empty());
}

#[test]
fn test_operations_require_an_open_connection() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());

    assert!(matches!(session.start(), Err(DaqError::Connection(_))));
    assert!(matches!(session.verify(true), Err(DaqError::Connection(_))));
    assert!(matches!(session.poll(), Err(DaqError::Connection(_))));
    assert!(matches!(
        session.upload_wave(0, &[1, 2, 3]),
        Err(DaqError::Connection(_))
    ));
    // stopping a closed session is harmless
    assert!(session.stop().is_ok());
}

#[test]
fn test_invalid_channel_selection_rejected() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());

    assert!(session.open(StreamSpec::analog_in([0, 0])).is_err());
    assert!(session.open(StreamSpec::analog_in([4])).is_err());
    assert!(session.open(StreamSpec::digital_in([0, 2])).is_err());
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_continuous_parameters_pushed_in_order() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());

    session
        .open(StreamSpec::analog_in([1, 0]).with_rate(1000))
        .unwrap();

    assert_eq!(
        device.verbs(),
        ["connect", "rate", "aimask", "dimask", "immediate", "nchunks", "nscans"]
    );
    let log = device.call_log();
    assert!(log.contains(&"rate 1000".to_string()));
    assert!(log.contains(&"aimask 3".to_string()));
    assert!(log.contains(&"nchunks 0".to_string()));
    // 50 ms at 1 kHz
    assert!(log.contains(&"nscans 50".to_string()));
    assert_eq!(session.nscans(), Some(50));
}

#[test]
fn test_episodic_chunk_count_uses_confirmed_nscans() {
    let device = MockDevice::new();
    device.set_nscans_override(Some(250));
    let mut session = session(&device, &PortRegistry::new());

    session
        .open(StreamSpec::analog_in([0]).with_rate(10_000))
        .unwrap();
    device.clear_log();
    session
        .set_episodic(
            Duration::from_millis(100),
            Some(Duration::from_secs(1)),
            Some(3),
        )
        .unwrap();

    assert_eq!(
        device.verbs(),
        ["rate", "aimask", "dimask", "immediate", "nscans", "nchunks", "period", "nepis"]
    );
    let log = device.call_log();
    // the host asked for 500 but the device settled on 250
    assert!(log.contains(&"nscans 500".to_string()));
    assert!(log.contains(&"nchunks 4".to_string()));
    assert!(log.contains(&"period 1000".to_string()));
    assert!(log.contains(&"nepis 3".to_string()));
    assert_eq!(session.nscans(), Some(250));
}

#[test]
fn test_trigger_parameters() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    session
        .open(StreamSpec::analog_in([0]).with_rate(1000))
        .unwrap();
    device.clear_log();

    session.set_trigger(2, Polarity::Falling).unwrap();
    assert!(device.call_log().contains(&"trigger 2 -1".to_string()));
    assert!(session.set_trigger(7, Polarity::Rising).is_err());

    device.clear_log();
    session.set_immediate().unwrap();
    assert!(device.verbs().contains(&"immediate".to_string()));
}

#[test]
fn test_rejected_parameters_fail_start() {
    let device = MockDevice::new();
    device.reject_verify(Some("too many channels"));
    let mut session = session(&device, &PortRegistry::new());
    session
        .open(StreamSpec::analog_in([0, 1, 2, 3]).with_rate(1000))
        .unwrap();

    match session.start() {
        Err(DaqError::Verification(reason)) => assert_eq!(reason, "too many channels"),
        other => panic!("expected verification failure, got {:?}", other.err()),
    }
    assert!(!device.is_running());
    assert_eq!(session.state(), SessionState::Open);
    assert!(!device.verbs().contains(&"start".to_string()));
}

#[test]
fn test_start_without_rate_is_configuration_error() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    session.open(StreamSpec::analog_in([0])).unwrap();
    assert!(matches!(session.start(), Err(DaqError::Configuration(_))));
}

#[test]
fn test_verify_cached_until_parameters_change() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    session
        .open(StreamSpec::analog_in([0]).with_rate(1000))
        .unwrap();

    assert!(session.verify(false).unwrap());
    device.clear_log();
    assert!(session.verify(false).unwrap());
    assert!(device.call_log().is_empty());

    assert!(session.verify(true).unwrap());
    assert_eq!(device.verbs(), ["verify"]);

    session.set_rate(2000).unwrap();
    device.clear_log();
    assert!(session.verify(false).unwrap());
    assert_eq!(device.verbs(), ["verify"]);
}

#[test]
fn test_close_of_last_handle_resets_everything() {
    let device = MockDevice::new();
    let registry = PortRegistry::new();
    let mut session = session(&device, &registry);

    let ai = session
        .open(StreamSpec::analog_in([0]).with_rate(1000))
        .unwrap();
    session
        .set_episodic(Duration::from_millis(20), None, Some(1))
        .unwrap();
    session.close(ai).unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.rate_hz(), None);
    assert_eq!(session.aimask(), 0);
    assert!(session.param("rate").is_none());
    assert!(!device.is_connected());
    assert!(registry.is_available("mock0"));

    // reopening without a rate pushes nothing
    device.clear_log();
    session.open(StreamSpec::analog_in([0])).unwrap();
    assert_eq!(device.verbs(), ["connect"]);
}

#[test]
fn test_close_repushes_for_remaining_handles() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    session
        .open(StreamSpec::analog_in([0]).with_rate(1000))
        .unwrap();
    let di = session
        .open(StreamSpec::digital_in([0, 1]).with_rate(1000))
        .unwrap();
    assert_eq!(session.dimask(), 0b11);

    device.clear_log();
    session.close(di).unwrap();

    assert!(device.is_connected());
    assert_eq!(session.dimask(), 0);
    let log = device.call_log();
    assert!(log.contains(&"dimask 0".to_string()));
    assert!(log.contains(&"aimask 1".to_string()));
}

#[test]
fn test_close_stops_running_acquisition() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    let ai = session
        .open(StreamSpec::analog_in([0]).with_rate(1000))
        .unwrap();
    session.start().unwrap();
    assert!(device.is_running());

    session.close(ai).unwrap();
    assert!(!device.is_running());
    assert!(device.verbs().contains(&"stop".to_string()));
}

#[test]
fn test_device_info_while_closed() {
    let device = MockDevice::new();
    let registry = PortRegistry::new();
    let mut session = session(&device, &registry);

    let info = session.device_info().unwrap();
    assert_eq!(info.firmware, "1.3");
    assert_eq!(info.serial_number, "E6614103E7435B2F");
    assert_eq!(info.analog_in_count, 4);
    assert_eq!(info.max_rate_hz, 500_000);
    assert!(!device.is_connected());
    assert!(registry.is_available("mock0"));
}

#[test]
fn test_device_info_cached_while_open() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    session.open(StreamSpec::analog_in([0])).unwrap();

    let first = session.device_info().unwrap();
    device.clear_log();
    let cal = session.calibration().unwrap();
    let second = session.device_info().unwrap();
    assert_eq!(first, second);
    assert!(device.call_log().is_empty());
    assert!((cal.input_offset - 0.002).abs() < 1e-12);
}

/// Records every broadcast and asks for the same operation again, which must
/// not cause a second round.
struct Recorder {
    log: Rc<RefCell<Vec<String>>>,
    request_commit: bool,
    output: Option<u8>,
}

impl StreamHooks for Recorder {
    fn on_start(&mut self, fanout: &mut Fanout<'_>) -> picodaq::AppResult<()> {
        self.log.borrow_mut().push(format!("start {}", fanout.handle()));
        fanout.request_start();
        if self.request_commit {
            fanout.request_commit();
        }
        Ok(())
    }

    fn on_stop(&mut self, fanout: &mut Fanout<'_>) -> picodaq::AppResult<()> {
        self.log.borrow_mut().push(format!("stop {}", fanout.handle()));
        fanout.request_stop();
        Ok(())
    }

    fn on_commit(&mut self, fanout: &mut Fanout<'_>) -> picodaq::AppResult<()> {
        self.log.borrow_mut().push(format!("commit {}", fanout.handle()));
        fanout.request_commit();
        if let Some(channel) = self.output {
            let ramp: Vec<i16> = (0..500).collect();
            fanout.stage_output(
                OutputPayload::new().with_analog(channel, SampleSource::buffer(ramp)),
            );
        }
        Ok(())
    }
}

fn recorder(log: &Rc<RefCell<Vec<String>>>) -> Recorder {
    Recorder {
        log: log.clone(),
        request_commit: false,
        output: None,
    }
}

#[test]
fn test_reentrant_hooks_run_once_per_broadcast() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    let log = Rc::new(RefCell::new(Vec::new()));

    let ai = session
        .open_with_hooks(StreamSpec::analog_in([0]).with_rate(1000), recorder(&log))
        .unwrap();
    let di = session
        .open_with_hooks(StreamSpec::digital_in([0]), recorder(&log))
        .unwrap();

    session.start().unwrap();
    session.stop().unwrap();

    let expected: Vec<String> = vec![
        format!("start {}", ai),
        format!("start {}", di),
        format!("stop {}", ai),
        format!("stop {}", di),
    ];
    assert_eq!(*log.borrow(), expected);
    assert_eq!(
        device.verbs().iter().filter(|v| *v == "start").count(),
        1
    );
}

#[test]
fn test_commit_requested_at_start_runs_before_device_start() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    let log = Rc::new(RefCell::new(Vec::new()));

    let ai: HandleId = session
        .open_with_hooks(
            StreamSpec::analog_in([0]).with_rate(1000),
            Recorder {
                request_commit: true,
                ..recorder(&log)
            },
        )
        .unwrap();
    let ao = session
        .open_with_hooks(
            StreamSpec::analog_out([1]),
            Recorder {
                output: Some(1),
                ..recorder(&log)
            },
        )
        .unwrap();

    session.start().unwrap();

    let expected: Vec<String> = vec![
        format!("start {}", ai),
        format!("start {}", ao),
        format!("commit {}", ai),
        format!("commit {}", ao),
    ];
    assert_eq!(*log.borrow(), expected);

    let verbs = device.verbs();
    let sampled = verbs.iter().position(|v| v == "sampled").unwrap();
    let start = verbs.iter().position(|v| v == "start").unwrap();
    assert!(sampled < start);
    assert!(device.call_log().contains(&"sampled 2 0 50".to_string()));
    // 500 samples at 50 scans per chunk
    assert_eq!(device.output_chunks().len(), 10);
    session.stop().unwrap();
}

#[test]
fn test_output_must_belong_to_the_handle() {
    let device = MockDevice::new();
    let mut session = session(&device, &PortRegistry::new());
    let ao = session
        .open(StreamSpec::analog_out([0]).with_rate(1000))
        .unwrap();

    let wrong_channel = OutputPayload::new().with_analog(3, SampleSource::buffer(vec![0i16; 10]));
    assert!(session.stage_output(ao, wrong_channel).is_err());

    let digital = OutputPayload::new().with_digital(0, SampleSource::buffer(vec![1u8; 8]));
    assert!(session.stage_output(ao, digital).is_err());
}
