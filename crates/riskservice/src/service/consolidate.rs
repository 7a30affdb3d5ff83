use crate::plugins::CalculationResult;

/// Sort results by `as_of` and keep only the last result of each run sharing a timestamp.
///
/// The output has strictly increasing timestamps and consolidating it again is a no-op.
pub fn consolidate(mut results: Vec<CalculationResult>) -> Vec<CalculationResult> {
    results.sort_by_key(|result| result.as_of);

    // dedup_by_key keeps the first of a run, so walk the runs back to front.
    results.reverse();
    results.dedup_by_key(|result| result.as_of);
    results.reverse();
    results
}
