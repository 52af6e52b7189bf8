use clap::ValueEnum;
use std::fmt;

/// One sensor stream of the smoker rig. Each channel maps 1:1 onto a durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ChannelId {
    Smoker,
    FoodA,
    FoodB,
}

impl ChannelId {
    pub const ALL: [ChannelId; 3] = [ChannelId::Smoker, ChannelId::FoodA, ChannelId::FoodB];

    /// Column holding this channel's reading in a source row (column 0 is the timestamp).
    pub fn source_column(self) -> usize {
        match self {
            ChannelId::Smoker => 1,
            ChannelId::FoodA => 2,
            ChannelId::FoodB => 3,
        }
    }

    pub fn default_queue(self) -> &'static str {
        match self {
            ChannelId::Smoker => "temp1",
            ChannelId::FoodA => "temp2",
            ChannelId::FoodB => "temp3",
        }
    }

    pub fn sink_file_name(self) -> &'static str {
        match self {
            ChannelId::Smoker => "Smoker.csv",
            ChannelId::FoodA => "FoodA.csv",
            ChannelId::FoodB => "FoodB.csv",
        }
    }

    pub fn alert_label(self) -> &'static str {
        match self {
            ChannelId::Smoker => "smoker temperature stall",
            ChannelId::FoodA | ChannelId::FoodB => "food stall",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelId::Smoker => "smoker",
            ChannelId::FoodA => "food-a",
            ChannelId::FoodB => "food-b",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A channel bound to the queue name it is published to / consumed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub queue: String,
}

impl ChannelSpec {
    pub fn new(id: ChannelId, queue: impl Into<String>) -> Self {
        Self {
            id,
            queue: queue.into(),
        }
    }

    pub fn with_default_queue(id: ChannelId) -> Self {
        Self::new(id, id.default_queue())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_use_distinct_columns_queues_and_sinks() {
        let columns: Vec<_> = ChannelId::ALL.iter().map(|c| c.source_column()).collect();
        assert_eq!(columns, vec![1, 2, 3]);

        let queues: Vec<_> = ChannelId::ALL.iter().map(|c| c.default_queue()).collect();
        assert_eq!(queues, vec!["temp1", "temp2", "temp3"]);

        assert_eq!(ChannelId::FoodB.sink_file_name(), "FoodB.csv");
        assert_eq!(
            ChannelSpec::with_default_queue(ChannelId::FoodA).queue,
            "temp2"
        );
    }

    #[test]
    fn cli_names_round_trip_through_value_enum() {
        for channel in ChannelId::ALL {
            let parsed = ChannelId::from_str(channel.as_str(), true).expect("parse channel");
            assert_eq!(parsed, channel);
        }
    }
}
