// src/drivers/brainflow.rs
use anyhow::{anyhow, Context, Result};
use libloading::Library;
use ndarray::Array2;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::ffi::CString;
use std::os::raw::{c_char, c_double, c_int};

use crate::drivers::error::{ConnectError, FetchError};
use crate::drivers::source::{release_logged, SampleBatch, SampleSource, Session};
use crate::types::Target;

/// BrainFlow board id for a Cyton behind the USB dongle.
pub const BOARD_ID_CYTON: c_int = 0;
/// BrainFlow board id for a Cyton with the WiFi shield.
pub const BOARD_ID_CYTON_WIFI: c_int = 5;
const PRESET_DEFAULT: c_int = 0;
const STREAM_RINGBUF_PACKETS: c_int = 450_000;
const NO_BOARD: i32 = -100;

// BrainFlow exit codes we classify.
const STATUS_OK: c_int = 0;
const UNABLE_TO_OPEN_PORT_ERROR: c_int = 2;
const BOARD_WRITE_ERROR: c_int = 4;
const BOARD_NOT_READY_ERROR: c_int = 7;
const BOARD_NOT_CREATED_ERROR: c_int = 15;
const ANOTHER_BOARD_IS_CREATED_ERROR: c_int = 16;
const GENERAL_ERROR: c_int = 17;

#[derive(Serialize)]
struct BrainFlowInputParams {
    serial_port: String,
    mac_address: String,
    ip_address: String,
    ip_address_aux: String,
    ip_address_anc: String,
    ip_port: i32,
    ip_port_aux: i32,
    ip_port_anc: i32,
    ip_protocol: i32,
    other_info: String,
    timeout: i32,
    serial_number: String,
    file: String,
    file_aux: String,
    file_anc: String,
    master_board: i32,
}

impl BrainFlowInputParams {
    fn empty() -> Self {
        Self {
            serial_port: String::new(),
            mac_address: String::new(),
            ip_address: String::new(),
            ip_address_aux: String::new(),
            ip_address_anc: String::new(),
            ip_port: 0,
            ip_port_aux: 0,
            ip_port_anc: 0,
            ip_protocol: 0,
            other_info: String::new(),
            timeout: 0,
            serial_number: String::new(),
            file: String::new(),
            file_aux: String::new(),
            file_anc: String::new(),
            master_board: NO_BOARD,
        }
    }

    fn for_target(target: &Target) -> Self {
        match target {
            Target::Serial { port } => Self {
                serial_port: port.clone(),
                ..Self::empty()
            },
            // The shield is discovered over SSDP; the name only narrows the search.
            Target::Wireless { device_name, port } => Self {
                ip_port: i32::from(*port),
                other_info: device_name.clone().unwrap_or_default(),
                timeout: 10,
                ..Self::empty()
            },
        }
    }
}

/// Maps a BrainFlow exit code from prepare/start onto the connect taxonomy.
pub fn classify_connect_code(code: c_int, target: &Target) -> ConnectError {
    let target = target.to_string();
    match code {
        UNABLE_TO_OPEN_PORT_ERROR => ConnectError::TransportUnavailable {
            target,
            detail: format!("UNABLE_TO_OPEN_PORT_ERROR:{code}"),
        },
        BOARD_WRITE_ERROR => ConnectError::TransportUnavailable {
            target,
            detail: format!("BOARD_WRITE_ERROR:{code}"),
        },
        GENERAL_ERROR => ConnectError::TransportUnavailable {
            target,
            detail: format!("GENERAL_ERROR:{code}"),
        },
        BOARD_NOT_READY_ERROR => ConnectError::DeviceNotReady {
            target,
            detail: format!("BOARD_NOT_READY_ERROR:{code}"),
        },
        ANOTHER_BOARD_IS_CREATED_ERROR => ConnectError::DeviceLocked {
            target,
            detail: format!("ANOTHER_BOARD_IS_CREATED_ERROR:{code}"),
        },
        other => ConnectError::Unrecognized {
            target,
            detail: format!("BrainFlow code {other}"),
        },
    }
}

/// Maps a BrainFlow exit code from a running session onto the fetch taxonomy.
pub fn classify_fetch_code(code: c_int, ctx: &str) -> FetchError {
    if code == BOARD_NOT_CREATED_ERROR {
        FetchError::SessionInvalidated(format!("{ctx}: BOARD_NOT_CREATED_ERROR:{code}"))
    } else {
        FetchError::Unrecognized(format!("{ctx} failed (BrainFlow code {code})"))
    }
}

struct BrainFlowApi {
    #[allow(dead_code)]
    lib: Library,
    prepare_session: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    start_stream: unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char) -> c_int,
    stop_stream: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    release_session: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    get_num_rows: unsafe extern "C" fn(c_int, c_int, *mut c_int) -> c_int,
    get_exg_channels: unsafe extern "C" fn(c_int, c_int, *mut c_int, *mut c_int) -> c_int,
    get_current_board_data: unsafe extern "C" fn(
        c_int,
        c_int,
        *mut c_double,
        *mut c_int,
        c_int,
        *const c_char,
    ) -> c_int,
}

impl BrainFlowApi {
    fn load() -> Result<Self> {
        let name = libloading::library_filename("BoardController");
        let lib = unsafe { Library::new(&name) }
            .with_context(|| format!("{} not found in working directory", name.to_string_lossy()))?;
        // Safety: signatures follow the BrainFlow C API.
        unsafe {
            Ok(Self {
                prepare_session: *lib.get(b"prepare_session\0")?,
                start_stream: *lib.get(b"start_stream\0")?,
                stop_stream: *lib.get(b"stop_stream\0")?,
                release_session: *lib.get(b"release_session\0")?,
                get_num_rows: *lib.get(b"get_num_rows\0")?,
                get_exg_channels: *lib.get(b"get_exg_channels\0")?,
                get_current_board_data: *lib.get(b"get_current_board_data\0")?,
                lib,
            })
        }
    }

    fn instance() -> Result<&'static BrainFlowApi> {
        static API: OnceCell<BrainFlowApi> = OnceCell::new();
        API.get_or_try_init(Self::load)
    }

    fn num_rows(&self, board_id: c_int) -> Result<usize> {
        let mut rows: c_int = 0;
        let code = unsafe { (self.get_num_rows)(board_id, PRESET_DEFAULT, &mut rows as *mut c_int) };
        if code != STATUS_OK {
            return Err(anyhow!("get_num_rows failed (BrainFlow code {code})"));
        }
        Ok(rows.max(0) as usize)
    }

    fn exg_channels(&self, board_id: c_int, max_channels: usize) -> Result<Vec<usize>> {
        let mut out_len: c_int = 0;
        let mut buf = vec![0 as c_int; max_channels.max(32)];
        let code = unsafe {
            (self.get_exg_channels)(
                board_id,
                PRESET_DEFAULT,
                buf.as_mut_ptr(),
                &mut out_len as *mut c_int,
            )
        };
        if code != STATUS_OK {
            return Err(anyhow!("get_exg_channels failed (BrainFlow code {code})"));
        }
        buf.truncate(out_len.max(0) as usize);
        Ok(buf.into_iter().map(|c| c.max(0) as usize).collect())
    }
}

/// Opens BrainFlow sessions for OpenBCI Cyton boards (dongle or WiFi shield).
pub struct BrainFlowSource {
    serial_board_id: c_int,
    wireless_board_id: c_int,
}

impl BrainFlowSource {
    pub fn new() -> Self {
        Self {
            serial_board_id: BOARD_ID_CYTON,
            wireless_board_id: BOARD_ID_CYTON_WIFI,
        }
    }

    pub fn with_board_ids(serial_board_id: i32, wireless_board_id: i32) -> Self {
        Self {
            serial_board_id,
            wireless_board_id,
        }
    }
}

impl Default for BrainFlowSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for BrainFlowSource {
    type Session = BrainFlowSession;

    fn open(&mut self, target: &Target) -> Result<BrainFlowSession, ConnectError> {
        let unrecognized = |err: anyhow::Error| ConnectError::Unrecognized {
            target: target.to_string(),
            detail: format!("{err:#}"),
        };
        let api = BrainFlowApi::instance().map_err(unrecognized)?;
        let board_id = match target {
            Target::Serial { .. } => self.serial_board_id,
            Target::Wireless { .. } => self.wireless_board_id,
        };
        let params = BrainFlowInputParams::for_target(target);
        let json = serde_json::to_string(&params)
            .context("failed to serialize BrainFlow input params")
            .map_err(unrecognized)?;
        let input_json = CString::new(json)
            .context("failed to encode BrainFlow input params to C string")
            .map_err(unrecognized)?;
        let code = unsafe { (api.prepare_session)(board_id, input_json.as_ptr()) };
        if code != STATUS_OK {
            return Err(classify_connect_code(code, target));
        }
        let mut session = BrainFlowSession {
            api,
            board_id,
            input_json,
            target: target.clone(),
            exg_channels: Vec::new(),
            num_rows: 0,
            is_streaming: false,
            released: false,
        };
        // The session is prepared at this point, so a failed lookup must still release it.
        let layout = api
            .num_rows(board_id)
            .and_then(|rows| Ok((rows, api.exg_channels(board_id, rows)?)));
        match layout {
            Ok((rows, channels)) => {
                session.num_rows = rows;
                session.exg_channels = channels;
                Ok(session)
            }
            Err(err) => {
                release_logged(&mut session, "board layout lookup failed");
                Err(unrecognized(err))
            }
        }
    }
}

/// A prepared BrainFlow session.
pub struct BrainFlowSession {
    api: &'static BrainFlowApi,
    board_id: c_int,
    input_json: CString,
    target: Target,
    exg_channels: Vec<usize>,
    num_rows: usize,
    is_streaming: bool,
    released: bool,
}

impl BrainFlowSession {
    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl Session for BrainFlowSession {
    fn num_channels(&self) -> usize {
        self.exg_channels.len()
    }

    fn start(&mut self) -> Result<(), ConnectError> {
        if self.is_streaming {
            return Ok(());
        }
        let code = unsafe {
            (self.api.start_stream)(
                STREAM_RINGBUF_PACKETS,
                std::ptr::null(),
                self.board_id,
                self.input_json.as_ptr(),
            )
        };
        if code != STATUS_OK {
            return Err(classify_connect_code(code, &self.target));
        }
        self.is_streaming = true;
        Ok(())
    }

    fn fetch(&mut self, max_samples: usize) -> Result<Option<SampleBatch>, FetchError> {
        if self.released {
            return Err(FetchError::SessionInvalidated("session already released".into()));
        }
        if max_samples == 0 || self.num_rows == 0 {
            return Ok(None);
        }
        let mut buf = vec![0.0f64; self.num_rows * max_samples];
        let mut current_size: c_int = 0;
        let code = unsafe {
            (self.api.get_current_board_data)(
                max_samples as c_int,
                PRESET_DEFAULT,
                buf.as_mut_ptr(),
                &mut current_size as *mut c_int,
                self.board_id,
                self.input_json.as_ptr(),
            )
        };
        if code != STATUS_OK {
            return Err(classify_fetch_code(code, "get_current_board_data"));
        }
        let available = (current_size.max(0) as usize).min(max_samples);
        if available == 0 {
            return Ok(None);
        }
        // BrainFlow packs the result row by row: row r holds `available` samples.
        let rows = &self.exg_channels;
        let data = Array2::from_shape_fn((rows.len(), available), |(c, s)| {
            buf.get(rows[c] * available + s).copied().unwrap_or(0.0)
        });
        Ok(Some(SampleBatch::new(data)))
    }

    fn stop(&mut self) -> Result<(), FetchError> {
        if self.released || !self.is_streaming {
            return Ok(());
        }
        self.is_streaming = false;
        let code = unsafe { (self.api.stop_stream)(self.board_id, self.input_json.as_ptr()) };
        if code != STATUS_OK {
            return Err(classify_fetch_code(code, "stop_stream"));
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), FetchError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let code = unsafe { (self.api.release_session)(self.board_id, self.input_json.as_ptr()) };
        if code != STATUS_OK {
            return Err(classify_fetch_code(code, "release_session"));
        }
        Ok(())
    }
}

impl Drop for BrainFlowSession {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("stopping stream on {} failed: {err}", self.target);
        }
        let target = self.target.to_string();
        release_logged(self, &target);
    }
}
