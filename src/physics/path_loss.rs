use crate::config::RadioConfig;

const C_LIGHT: f64 = 299_792_458.0;

pub fn calculate_wavelength(freq_mhz: f64) -> f64 {
    C_LIGHT / (freq_mhz * 1e6)
}

/// Free-space path loss in dB (Friis).
pub fn free_space_path_loss_db(dist_m: f64, freq_mhz: f64) -> f64 {
    let d = dist_m.max(1.0);
    20.0 * (4.0 * std::f64::consts::PI * d / calculate_wavelength(freq_mhz)).log10()
}

/// Log-distance model anchored on free space at 1 m:
/// PL(d) = FSPL(1 m) + 10 * n * log10(d)
pub fn log_distance_path_loss_db(dist_m: f64, freq_mhz: f64, exponent: f64) -> f64 {
    let d = dist_m.max(1.0);
    free_space_path_loss_db(1.0, freq_mhz) + 10.0 * exponent * d.log10()
}

pub fn received_power_dbm(radio: &RadioConfig, dist_m: f64) -> f64 {
    radio.tx_power_dbm + radio.tx_antenna_gain_dbi + radio.rx_antenna_gain_dbi
        - log_distance_path_loss_db(dist_m, radio.frequency_mhz, radio.path_loss_exponent)
}

/// Probability that a signal at `rx_dbm` is decoded: logistic in the margin
/// over receiver sensitivity, 0.5 at the sensitivity floor.
pub fn link_probability(radio: &RadioConfig, rx_dbm: f64) -> f64 {
    let margin = rx_dbm - radio.receiver_sensitivity_dbm;
    let slope = radio.fade_margin_slope_db.max(f64::EPSILON);
    (1.0 / (1.0 + (-margin / slope).exp())).clamp(0.0, 1.0)
}
