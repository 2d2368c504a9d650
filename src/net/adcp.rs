//! ADCP: the binary command protocol.
//!
//! A client message is `[prefix][command][args...]`; the prefix selects a
//! command group. Every reply and every streamed message carries the 3-byte
//! header `[send_type][length u16 LE]`; direct command replies use send
//! type NONE. The first reply byte is a `ResponseCode`, followed by
//! command-specific data.

use crate::adc::REF_INTERNAL_TENS_NANOVOLT;
use crate::error::ResponseCode;
use crate::instrument::Instrument;
use crate::net::connection::Connection;

pub const PREFIX_CONNECTION: u8 = 0x10;
pub const PREFIX_DEBUGGING: u8 = 0x20;
pub const PREFIX_MEASUREMENT: u8 = 0x30;
pub const PREFIX_ADC: u8 = 0x40;
pub const PREFIX_FFT: u8 = 0x50;
pub const PREFIX_CALIBRATION: u8 = 0x60;

pub const CONNECTION_SET_TYPE: u8 = 0x00;

pub const DEBUGGING_NETWORK_STATS: u8 = 0x00;
pub const DEBUGGING_TEST_SCHEDULER: u8 = 0x01;
pub const DEBUGGING_TEST_MEMORY_BW: u8 = 0x02;
pub const DEBUGGING_OS_STATS: u8 = 0x03;
pub const DEBUGGING_CONNECTION_STATS: u8 = 0x04;

pub const MEASUREMENT_START: u8 = 0x00;
pub const MEASUREMENT_STOP: u8 = 0x01;
pub const MEASUREMENT_CREATE: u8 = 0x02;
pub const MEASUREMENT_DELETE: u8 = 0x03;
pub const MEASUREMENT_SET_INPUTS: u8 = 0x04;
pub const MEASUREMENT_SET_ENABLED: u8 = 0x05;
pub const MEASUREMENT_SET_AVERAGING: u8 = 0x06;
pub const MEASUREMENT_ONE_SHOT: u8 = 0x07;

pub const ADC_RESET: u8 = 0x00;
pub const ADC_SET_SR: u8 = 0x01;
pub const ADC_SET_FILTER: u8 = 0x02;
pub const ADC_PGA_SET_GAIN: u8 = 0x03;
pub const ADC_PGA_BYPASS: u8 = 0x04;
pub const ADC_REF_SET_INTERNAL: u8 = 0x05;
pub const ADC_REF_SET_EXTERNAL: u8 = 0x06;
pub const ADC_GET_STATUS: u8 = 0x07;

pub const FFT_SET_ENABLED: u8 = 0x00;
pub const FFT_SET_LENGTH: u8 = 0x01;
pub const FFT_SET_WINDOW: u8 = 0x02;

pub const CALIBRATION_SET_OFFSET: u8 = 0x00;
pub const CALIBRATION_SET_SCALE: u8 = 0x01;
pub const CALIBRATION_DO_OFFSET: u8 = 0x02;
pub const CALIBRATION_DO_SCALE: u8 = 0x03;

/// Whether the connection should be closed after the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Exit,
}

/// Prepends the ADCP header to a payload.
pub fn frame(send_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(send_type);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn code(c: ResponseCode) -> Vec<u8> {
    vec![c as u8]
}

fn code_with(c: ResponseCode, rest: &[u8]) -> Vec<u8> {
    let mut out = vec![c as u8];
    out.extend_from_slice(rest);
    out
}

/// Argument length gate: `expected` counts argument bytes after prefix and
/// command. Short messages answer with the expected count and close the
/// connection.
fn check_arg_len(len: usize, expected: u8) -> Option<(Vec<u8>, Disposition)> {
    if len < expected as usize + 2 {
        Some((
            vec![ResponseCode::TooFewArguments as u8, expected],
            Disposition::Exit,
        ))
    } else {
        None
    }
}

fn invalid_command(command: u8) -> (Vec<u8>, Disposition) {
    (
        vec![ResponseCode::InvalidCommand as u8, command],
        Disposition::Exit,
    )
}

/// Dispatches one client message and produces the unframed reply payload.
pub fn handle_command(
    instrument: &Instrument,
    connection: &Connection,
    data: &[u8],
) -> (Vec<u8>, Disposition) {
    if data.len() < 2 {
        return (code(ResponseCode::MessageTooShort), Disposition::Exit);
    }

    let prefix = data[0];
    match prefix {
        PREFIX_CONNECTION => handle_connection(connection, data),
        PREFIX_DEBUGGING => handle_debugging(instrument, data),
        PREFIX_MEASUREMENT => handle_measurement(instrument, data),
        PREFIX_ADC => handle_adc(instrument, data),
        PREFIX_FFT => handle_fft(instrument, data),
        PREFIX_CALIBRATION => handle_calibration(instrument, data),
        _ => (
            vec![ResponseCode::InvalidPrefix as u8, prefix],
            Disposition::Exit,
        ),
    }
}

fn handle_connection(connection: &Connection, data: &[u8]) -> (Vec<u8>, Disposition) {
    let command = data[1];
    match command {
        CONNECTION_SET_TYPE => {
            if let Some(err) = check_arg_len(data.len(), 1) {
                return err;
            }
            connection.set_send_type(data[2]);
            (code(ResponseCode::Ok), Disposition::Continue)
        }
        _ => invalid_command(command),
    }
}

fn handle_debugging(instrument: &Instrument, data: &[u8]) -> (Vec<u8>, Disposition) {
    let command = data[1];
    let reply = match command {
        DEBUGGING_NETWORK_STATS => instrument.streamer.stats_string().into_bytes(),
        DEBUGGING_TEST_SCHEDULER | DEBUGGING_TEST_MEMORY_BW => code(ResponseCode::NotEnabled),
        DEBUGGING_OS_STATS => format!(
            "uptime: {} ticks\nacquisition: {:?}\n",
            instrument.clock.ticks(),
            instrument.acquisition.state()
        )
        .into_bytes(),
        DEBUGGING_CONNECTION_STATS => instrument.connections.stats_string().into_bytes(),
        _ => return invalid_command(command),
    };
    (reply, Disposition::Continue)
}

fn handle_measurement(instrument: &Instrument, data: &[u8]) -> (Vec<u8>, Disposition) {
    let command = data[1];
    let args = &data[2..];

    // After a converter reset nothing measurement-related is trustworthy
    // until the client explicitly resets.
    if instrument.state.is_adc_reset_set() {
        return (code(ResponseCode::AdcReset), Disposition::Continue);
    }

    let reply = match command {
        MEASUREMENT_START => {
            let result = instrument.acquisition.start();
            instrument.state.update_adc_state(false);
            code(result)
        }
        MEASUREMENT_STOP => {
            let result = instrument.acquisition.stop();
            instrument.state.update_adc_state(false);
            code(result)
        }
        MEASUREMENT_CREATE => {
            // pos, neg, enabled, averaging u16
            if let Some(err) = check_arg_len(data.len(), 5) {
                return err;
            }
            if instrument.acquisition.is_active() {
                code(ResponseCode::MeasurementActive)
            } else {
                let averaging = u16::from_le_bytes([args[3], args[4]]);
                match instrument
                    .registry
                    .lock()
                    .create(args[0], args[1], args[2] != 0, averaging)
                {
                    Ok(id) => code_with(ResponseCode::Ok, &[id]),
                    Err(e) => code(e),
                }
            }
        }
        MEASUREMENT_DELETE => {
            if let Some(err) = check_arg_len(data.len(), 1) {
                return err;
            }
            if instrument.acquisition.is_active() {
                code(ResponseCode::MeasurementActive)
            } else {
                code(instrument.registry.lock().delete(args[0]))
            }
        }
        MEASUREMENT_SET_INPUTS => {
            if let Some(err) = check_arg_len(data.len(), 3) {
                return err;
            }
            if instrument.acquisition.is_active() {
                code(ResponseCode::MeasurementActive)
            } else {
                code(result_code(
                    instrument.registry.lock().set_inputs(args[0], args[1], args[2]),
                ))
            }
        }
        MEASUREMENT_SET_ENABLED => {
            if let Some(err) = check_arg_len(data.len(), 2) {
                return err;
            }
            if instrument.acquisition.is_active() {
                code(ResponseCode::MeasurementActive)
            } else {
                code(result_code(
                    instrument.registry.lock().set_enabled(args[0], args[1] != 0),
                ))
            }
        }
        MEASUREMENT_SET_AVERAGING => {
            if let Some(err) = check_arg_len(data.len(), 3) {
                return err;
            }
            if instrument.acquisition.is_active() {
                code(ResponseCode::MeasurementActive)
            } else {
                let averaging = u16::from_le_bytes([args[1], args[2]]);
                code(result_code(
                    instrument.registry.lock().set_averaging(args[0], averaging),
                ))
            }
        }
        MEASUREMENT_ONE_SHOT => {
            if let Some(err) = check_arg_len(data.len(), 1) {
                return err;
            }
            let (result, value) = match instrument.acquisition.oneshot(args[0]) {
                Ok(value) => (ResponseCode::Ok, value),
                Err(e) => (e, 0),
            };
            code_with(result, &value.to_le_bytes())
        }
        _ => return invalid_command(command),
    };

    instrument.state.update_measurement_state(true);
    (reply, Disposition::Continue)
}

fn handle_adc(instrument: &Instrument, data: &[u8]) -> (Vec<u8>, Disposition) {
    let command = data[1];
    let args = &data[2..];
    let adc = &*instrument.adc;

    if instrument.acquisition.is_active() && command != ADC_GET_STATUS {
        return (code(ResponseCode::MeasurementActive), Disposition::Continue);
    }
    if instrument.state.is_adc_reset_set() && command != ADC_RESET && command != ADC_GET_STATUS {
        return (code(ResponseCode::AdcReset), Disposition::Continue);
    }

    let reply = match command {
        ADC_RESET => {
            adc.reset();
            instrument.state.clear_adc_reset_flag();
            instrument.state.reprogram_adc();
            code(ResponseCode::Ok)
        }
        ADC_SET_SR => {
            if let Some(err) = check_arg_len(data.len(), 1) {
                return err;
            }
            if args[0] > 15 {
                return (code(ResponseCode::WrongArgument), Disposition::Exit);
            }
            adc.set_samplerate(args[0]);
            code(ResponseCode::Ok)
        }
        ADC_SET_FILTER => {
            if let Some(err) = check_arg_len(data.len(), 1) {
                return err;
            }
            if args[0] > 4 {
                return (code(ResponseCode::WrongArgument), Disposition::Exit);
            }
            adc.set_filter(args[0]);
            code(ResponseCode::Ok)
        }
        ADC_PGA_SET_GAIN => {
            if let Some(err) = check_arg_len(data.len(), 1) {
                return err;
            }
            if args[0] > 5 {
                return (code(ResponseCode::WrongArgument), Disposition::Exit);
            }
            adc.set_gain(args[0]);
            code(ResponseCode::Ok)
        }
        ADC_PGA_BYPASS => {
            adc.bypass_pga();
            code(ResponseCode::Ok)
        }
        ADC_REF_SET_INTERNAL => {
            adc.enable_internal_reference();
            // Pins 0/0 select the internal reference source.
            adc.set_reference(0, 0, REF_INTERNAL_TENS_NANOVOLT);
            code(ResponseCode::Ok)
        }
        ADC_REF_SET_EXTERNAL => {
            // v_ref u32 (10 nV units), pos pin, neg pin
            if let Some(err) = check_arg_len(data.len(), 6) {
                return err;
            }
            let v_ref = u32::from_le_bytes([args[0], args[1], args[2], args[3]]) as u64;
            let pos = args[4];
            let neg = args[5];
            // The reference multiplexer offers inputs 1 through 5.
            if !(1..=5).contains(&pos) || !(1..=5).contains(&neg) {
                return (
                    code(ResponseCode::WrongReferencePins),
                    Disposition::Continue,
                );
            }
            adc.set_reference(pos, neg, v_ref);
            adc.disable_internal_reference();
            code(ResponseCode::Ok)
        }
        ADC_GET_STATUS => code_with(ResponseCode::Ok, &instrument.state.snapshot_bytes()),
        _ => return invalid_command(command),
    };

    // Everything except a pure status read changed converter state.
    if command != ADC_GET_STATUS || !instrument.acquisition.is_active() {
        instrument.state.update_adc_state(true);
    }

    (reply, Disposition::Continue)
}

fn handle_fft(instrument: &Instrument, data: &[u8]) -> (Vec<u8>, Disposition) {
    let command = data[1];
    let args = &data[2..];

    if instrument.acquisition.is_active() {
        return (code(ResponseCode::MeasurementActive), Disposition::Continue);
    }

    let reply = match command {
        FFT_SET_ENABLED => {
            if let Some(err) = check_arg_len(data.len(), 2) {
                return err;
            }
            match instrument.registry.lock().get_mut(args[0]) {
                None => code(ResponseCode::NoSuchMeasurement),
                Some(m) => {
                    m.fft.set_enabled(args[1] != 0);
                    code(ResponseCode::Ok)
                }
            }
        }
        FFT_SET_LENGTH => {
            if let Some(err) = check_arg_len(data.len(), 3) {
                return err;
            }
            match instrument.registry.lock().get_mut(args[0]) {
                None => code(ResponseCode::NoSuchMeasurement),
                Some(m) => {
                    let length = u16::from_le_bytes([args[1], args[2]]);
                    if m.fft.set_length(length) {
                        code(ResponseCode::Ok)
                    } else {
                        code(ResponseCode::FftInvalidLength)
                    }
                }
            }
        }
        FFT_SET_WINDOW => {
            if let Some(err) = check_arg_len(data.len(), 2) {
                return err;
            }
            match instrument.registry.lock().get_mut(args[0]) {
                None => code(ResponseCode::NoSuchMeasurement),
                Some(m) => code(m.fft.set_window(args[1])),
            }
        }
        _ => return invalid_command(command),
    };

    instrument.state.update_measurement_state(true);
    (reply, Disposition::Continue)
}

fn handle_calibration(instrument: &Instrument, data: &[u8]) -> (Vec<u8>, Disposition) {
    let command = data[1];
    let args = &data[2..];

    if instrument.acquisition.is_active() {
        return (code(ResponseCode::MeasurementActive), Disposition::Continue);
    }
    if instrument.state.is_adc_reset_set() {
        return (code(ResponseCode::AdcReset), Disposition::Continue);
    }

    let reply = match command {
        CALIBRATION_SET_OFFSET => {
            if let Some(err) = check_arg_len(data.len(), 4) {
                return err;
            }
            let offset = i32::from_le_bytes([args[0], args[1], args[2], args[3]]);
            instrument.adc.set_calibration_offset(offset);
            code(ResponseCode::Ok)
        }
        CALIBRATION_SET_SCALE => {
            if let Some(err) = check_arg_len(data.len(), 4) {
                return err;
            }
            let scale = u32::from_le_bytes([args[0], args[1], args[2], args[3]]);
            instrument.adc.set_calibration_scale(scale);
            code(ResponseCode::Ok)
        }
        CALIBRATION_DO_OFFSET => {
            if let Some(err) = check_arg_len(data.len(), 2) {
                return err;
            }
            let (result, value) = match instrument.acquisition.do_offset_calibration(args[0], args[1])
            {
                Ok(offset) => (ResponseCode::Ok, offset),
                Err(e) => (e, 0),
            };
            code_with(result, &value.to_le_bytes())
        }
        CALIBRATION_DO_SCALE => {
            if let Some(err) = check_arg_len(data.len(), 2) {
                return err;
            }
            let (result, value) = match instrument.acquisition.do_scale_calibration(args[0], args[1])
            {
                Ok(scale) => (ResponseCode::Ok, scale),
                Err(e) => (e, 0u32),
            };
            code_with(result, &value.to_le_bytes())
        }
        _ => return invalid_command(command),
    };

    instrument.state.update_adc_state(true);
    (reply, Disposition::Continue)
}

fn result_code(result: Result<(), ResponseCode>) -> ResponseCode {
    match result {
        Ok(()) => ResponseCode::Ok,
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SEND_TYPE_NONE;

    #[test]
    fn test_frame_layout() {
        let framed = frame(SEND_TYPE_NONE, &[0xAB, 0xCD]);
        assert_eq!(framed, vec![0x00, 0x02, 0x00, 0xAB, 0xCD]);
    }

    #[test]
    fn test_check_arg_len_reports_expected_count() {
        let (reply, disposition) = check_arg_len(3, 5).unwrap();
        assert_eq!(reply, vec![ResponseCode::TooFewArguments as u8, 5]);
        assert_eq!(disposition, Disposition::Exit);
        assert!(check_arg_len(7, 5).is_none());
    }
}
