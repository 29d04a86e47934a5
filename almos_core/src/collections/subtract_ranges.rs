//! Iterator over remaining regions from subtracting reserved regions from a whole block of memory.
//! See [`subtract_ranges`].

/// An iterator over the ranges in a whole memory range that exclude specified sub-ranges.
///
/// This struct is created by the [`subtract_ranges`] function. It implements the [`Iterator`] trait,
/// yielding ranges that are part of the whole range but not part of any sub-range.
pub struct SubtractRanges<I>
where
    I: Iterator<Item = (*mut u8, usize)>,
{
    whole_start: usize, // Start address of the whole range as usize.
    whole_end: usize,   // End address of the whole range.
    current_pos: usize, // Current position in the whole range.
    ranges: I,          // Iterator over sub-ranges to exclude.
    current_subrange: Option<(usize, usize)>, // Current sub-range being processed (start, end).
}

/// Returns an iterator over the ranges in `whole` that exclude the ranges provided by `ranges`.
///
/// This function performs interval subtraction, effectively subtracting the provided `ranges`
/// from the `whole` range. It takes a single continuous memory range `whole` (specified by a
/// pointer and length) and an iterator over sub-ranges to exclude. The returned iterator
/// yields the ranges of `whole` that are not covered by any of the sub-ranges.
///
/// # Arguments
///
/// * `whole` - A tuple containing the starting pointer and length in bytes of the whole range.
/// * `ranges` - An iterator over sub-ranges to exclude from the whole range. Each sub-range is
///   specified as a tuple of starting pointer and length in bytes. **The sub-ranges must be
///   ordered by starting address and must not overlap.**
///
/// # Returns
///
/// An iterator that yields tuples of starting pointers and lengths in bytes for the ranges
/// that are part of the whole range but not part of any sub-range.
///
/// # Notes
///
/// * The `ranges` iterator must yield sub-ranges in order by starting address and must not
///   contain overlapping sub-ranges. If these conditions are not met, the behavior is undefined.
pub fn subtract_ranges<I>(whole: (*mut u8, usize), ranges: I) -> SubtractRanges<I>
where
    I: Iterator<Item = (*mut u8, usize)>,
{
    let (whole_start_ptr, whole_len) = whole;
    let whole_start = whole_start_ptr as usize;
    let whole_end = whole_start.saturating_add(whole_len);

    SubtractRanges {
        whole_start,
        whole_end,
        current_pos: whole_start,
        ranges,
        current_subrange: None,
    }
}

impl<I> Iterator for SubtractRanges<I>
where
    I: Iterator<Item = (*mut u8, usize)>,
{
    type Item = (*mut u8, usize);

    /// Advances the iterator and returns the next non-excluded range.
    ///
    /// Returns `None` when there are no more non-excluded ranges to return.
    fn next(&mut self) -> Option<Self::Item> {
        while self.current_pos < self.whole_end {
            // Load the next sub-range if needed.
            if self.current_subrange.is_none() {
                // Load the next sub-range.
                self.current_subrange = self.ranges.find_map(|(start_ptr, len)| {
                    let start = start_ptr as usize;
                    let end = start.saturating_add(len);
                    let sub_start = start.max(self.whole_start);
                    let sub_end = end.min(self.whole_end);
                    if sub_start >= sub_end {
                        // Sub-range is outside the whole range or empty, skip it.
                        None
                    } else if sub_end <= self.current_pos {
                        // Sub-range ends before current position, skip it.
                        None
                    } else {
                        // Valid sub-range found.
                        Some((sub_start, sub_end))
                    }
                });
            }

            if let Some((sub_start, sub_end)) = self.current_subrange {
                if self.current_pos < sub_start {
                    // There is a gap between current position and sub_start.
                    let result_start = self.current_pos;
                    let result_end = sub_start;
                    let len = result_end - result_start;
                    self.current_pos = sub_start; // Move current position to sub_start
                                                  // Do not advance subrange, as we have not processed it yet.
                    return Some((result_start as *mut u8, len));
                }

                // current_pos >= sub_start
                self.current_pos = sub_end; // Skip over the sub-range.
                self.current_subrange = None; // Prepare to load next sub-range.
            } else {
                // No more sub-ranges, output the remaining range.
                let result_start = self.current_pos;
                let result_end = self.whole_end;
                let len = result_end - result_start;
                self.current_pos = self.whole_end;
                return (len > 0).then_some((result_start as *mut u8, len));
            }
        }
        None
    }
}
