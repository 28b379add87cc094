use rand::Rng;

/// Decides whether a flush cycle is transmitted.
///
/// Draws one integer uniformly from `1..=100` and sends if the draw is at most `sample_rate`. A rate of 0 never sends
/// and a rate of 100 always sends.
///
/// Sampling is applied to whole flush cycles rather than to individual metrics: all of a request's metrics are kept
/// or dropped together.
pub fn should_send<R: Rng + ?Sized>(sample_rate: u8, rng: &mut R) -> bool {
    let draw: u8 = rng.random_range(1..=100);
    draw <= sample_rate
}
