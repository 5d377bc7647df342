// Callback-driven I/O multiplexer for non-blocking TCP services.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Batched, time-decayed averaging used to predict typical timer delays.

/// A three-parameter exponentially weighted average. Samples accumulate into
/// a batch; [`AveragedStats::update_average`] folds the batch into the
/// aggregate, regressing towards `init_avg` and decaying the weight of
/// history by `persistence_factor`.
#[derive(Clone, Debug)]
pub(crate) struct AveragedStats {
    /// Reported average until the first update; with a positive
    /// `regress_weight` the average keeps regressing towards it.
    init_avg: f64,
    /// Sample weight of `init_avg` mixed into every update; zero disables
    /// the bias.
    regress_weight: f64,
    /// In [0, 1]: scales the aggregate weight of earlier batches when
    /// combining with the latest one. Higher adapts more slowly.
    persistence_factor: f64,
    batch_total_value: f64,
    batch_num_samples: f64,
    aggregate_total_weight: f64,
    aggregate_weighted_avg: f64,
}

impl AveragedStats {
    pub(crate) fn new(init_avg: f64, regress_weight: f64, persistence_factor: f64) -> AveragedStats {
        AveragedStats {
            init_avg,
            regress_weight,
            persistence_factor,
            batch_total_value: 0.0,
            batch_num_samples: 0.0,
            aggregate_total_weight: 0.0,
            aggregate_weighted_avg: init_avg,
        }
    }

    pub(crate) fn add_sample(&mut self, value: f64) {
        self.batch_total_value += value;
        self.batch_num_samples += 1.0;
    }

    pub(crate) fn update_average(&mut self) -> f64 {
        let mut weighted_sum = self.batch_total_value;
        let mut total_weight = self.batch_num_samples;
        if self.regress_weight > 0.0 {
            weighted_sum += self.regress_weight * self.init_avg;
            total_weight += self.regress_weight;
        }
        if self.persistence_factor > 0.0 {
            let prev_sample_weight = self.persistence_factor * self.aggregate_total_weight;
            weighted_sum += prev_sample_weight * self.aggregate_weighted_avg;
            total_weight += prev_sample_weight;
        }
        self.aggregate_weighted_avg = if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            self.init_avg
        };
        self.aggregate_total_weight = total_weight;
        self.batch_total_value = 0.0;
        self.batch_num_samples = 0.0;
        self.aggregate_weighted_avg
    }

    #[cfg(test)]
    pub(crate) fn aggregate_weighted_avg(&self) -> f64 { self.aggregate_weighted_avg }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[test]
    fn no_regression_no_persistence_is_a_plain_batch_mean() {
        let mut stats = AveragedStats::new(1000.0, 0.0, 0.0);
        assert_close(stats.aggregate_weighted_avg(), 1000.0);

        stats.add_sample(10.0);
        stats.add_sample(20.0);
        assert_close(stats.update_average(), 15.0);

        // an empty batch with no weight falls back to the initial average
        assert_close(stats.update_average(), 1000.0);
    }

    #[test]
    fn regression_pulls_towards_the_initial_average() {
        let mut stats = AveragedStats::new(100.0, 1.0, 0.0);
        stats.add_sample(0.0);
        // one real sample of 0 plus one bonus sample of 100
        assert_close(stats.update_average(), 50.0);
    }

    #[test]
    fn persistence_decays_history() {
        let mut stats = AveragedStats::new(0.0, 0.0, 0.5);
        stats.add_sample(8.0);
        assert_close(stats.update_average(), 8.0);

        // old weight 1 decays to 0.5; (4 + 0.5 * 8) / 1.5
        stats.add_sample(4.0);
        assert_close(stats.update_average(), 16.0 / 3.0);
    }

    #[test]
    fn shard_parameters_converge_sensibly() {
        // the per-shard configuration: init 1/0.33, regress 0.1, persist 0.5
        let mut stats = AveragedStats::new(1.0 / 0.33, 0.1, 0.5);
        for _ in 0..50 {
            stats.add_sample(0.5);
            stats.update_average();
        }
        let avg = stats.aggregate_weighted_avg();
        assert!((0.4..1.0).contains(&avg), "converged to {avg}");
    }
}
