pub mod averaging;
pub mod jobs;
pub mod metar;
pub mod observation_cache;
pub mod ogimet;
pub mod ride_weather;
pub mod stations;
