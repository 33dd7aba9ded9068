use std::time::Duration;

use pyflare::abi::PyAbi;

/// Sample rates and durations arrive as fractional seconds.
pub(crate) fn parse_seconds(arg: &str) -> Result<Duration, String> {
    let seconds: f64 = arg
        .parse()
        .map_err(|_| format!("`{arg}' isn't a valid number of seconds"))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("{seconds} is not a positive duration"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// ABIs are forced by Python version number; versions sharing an ABI all
/// map to the same tag.
pub(crate) fn parse_abi(arg: &str) -> Result<PyAbi, String> {
    let version: u32 = arg
        .parse()
        .map_err(|_| format!("`{arg}' isn't a valid ABI version"))?;
    match version {
        26 | 27 => Ok(PyAbi::V26),
        34 | 35 => Ok(PyAbi::V34),
        36 => Ok(PyAbi::V36),
        37 => Ok(PyAbi::V37),
        other => Err(format!("unknown or unsupported ABI version: {other}")),
    }
}
