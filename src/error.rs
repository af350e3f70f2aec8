use thiserror::Error;

/// Engine error codes.
///
/// The names are stable across implementations of the transport; success
/// (`OK` in the wire-level documentation) is `Result::Ok` here. Each code
/// maps to one fixed phrase, used verbatim by front ends.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("generic error")]
    Generic,
    #[error("libusb init failed")]
    LibusbInitFailed,
    #[error("can't open device")]
    CantOpenDev,
    #[error("can't set usb config")]
    CantSetUsbConfig,
    #[error("can't claim usb interface")]
    CantClaimIf,
    #[error("can't set usb alt setting")]
    CantSetAltSetting,
    #[error("can't clear endpoint")]
    CantClearEp,
    #[error("can't prepare transfer")]
    CantPrepareTransfer,
    #[error("can't find a matching device")]
    CantFindDev,
    #[error("'read_space' not set in context")]
    NoReadSpace,
    #[error("'write_space' not set in context")]
    NoWriteSpace,
    #[error("'read' not set in context")]
    NoRead,
    #[error("'write' not set in context")]
    NoWrite,
    #[error("'p2o_audio_buf' not set in context")]
    NoP2oAudioBuf,
    #[error("'o2p_audio_buf' not set in context")]
    NoO2pAudioBuf,
    #[error("'p2o_midi_buf' not set in context")]
    NoP2oMidiBuf,
    #[error("'o2p_midi_buf' not set in context")]
    NoO2pMidiBuf,
    #[error("'get_time' not set in context")]
    NoGetTime,
    #[error("'dll' not set in context")]
    NoDll,
}
