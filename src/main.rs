// This file is an example of how to use the `canopy_count` library.
// The main library entry point is `src/lib.rs`.

fn main() {
    println!("Canopy Count Estimation Engine - Example Runner");
    // In a real application, you would implement `RegionSegmenter` and
    // `PlantDetector` over your models, build a pipeline, and run a session:
    //
    // let config = canopy_count::PipelineConfig::default();
    // let pipeline = EstimationPipeline::new(config, segmenter, detector)?;
    // let result = pipeline.run(&photo).await?;
    // println!("estimated undetected plants: {}", result.total_estimated);
}
