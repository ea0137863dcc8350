pub mod outcome_map;
