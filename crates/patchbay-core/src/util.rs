//! General conversion functions and utilities.

/// De-interleave audio channels.
///
/// Channels beyond `num_interleaved_channels` are filled with silence.
pub fn deinterleave<'a>(
    mut channels: impl Iterator<Item = &'a mut [f32]>,
    interleaved: &[f32],
    num_interleaved_channels: usize,
) {
    for ch_i in 0..num_interleaved_channels {
        let Some(ch) = channels.next() else {
            return;
        };

        for (input, output) in interleaved
            .iter()
            .skip(ch_i)
            .step_by(num_interleaved_channels)
            .zip(ch.iter_mut())
        {
            *output = *input;
        }
    }

    for ch in channels {
        ch.fill(0.0);
    }
}

/// Interleave audio channels.
///
/// Interleaved channels with no matching input channel are silenced.
pub fn interleave<'a>(
    mut channels: impl Iterator<Item = &'a [f32]>,
    interleaved: &mut [f32],
    num_interleaved_channels: usize,
) {
    interleaved.fill(0.0);

    for ch_i in 0..num_interleaved_channels {
        let Some(ch) = channels.next() else {
            return;
        };

        for (output, input) in interleaved
            .iter_mut()
            .skip(ch_i)
            .step_by(num_interleaved_channels)
            .zip(ch.iter())
        {
            *output = *input;
        }
    }
}
