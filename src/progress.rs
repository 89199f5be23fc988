/// Completion percentage for `processed` out of `total` ports, clamped to `[0, 100]`.
///
/// An empty scan has nothing left to do and reports 100.
pub fn progress(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let pct = (processed as f64 * 100.0) / total as f64;
    pct.clamp(0.0, 100.0)
}
