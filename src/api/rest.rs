use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

use crate::clinical::{
    create_threshold, patient_overviews, AlertGenerator, ClassifiedMeasurement, Classifier, ClinicalError,
    ThresholdRequest,
};
use crate::config::Config;
use crate::ingest::{IngestError, Ingestor};
use crate::model::payload::{DataFormat, DevicesPayload};
use crate::model::{AttributeId, Patient, PatientUuid};
use crate::storage::{StorageEngine, StorageError};

type Reply = WithStatus<Json>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PatientRegistration {
    pub patient_group: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupQuery {
    pub group: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PeriodQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AtQuery {
    pub at: Option<DateTime<Utc>>,
}

/// A latest reading, labelled with its attribute
#[derive(Debug, Serialize)]
pub struct RecentMeasurement {
    pub attribute_name: String,
    pub attribute_units: String,
    #[serde(flatten)]
    pub reading: ClassifiedMeasurement,
}

fn success<T: Serialize>(message: &str, data: &T) -> Reply {
    match serde_json::to_value(data) {
        Ok(value) => respond(StatusCode::OK, "success", message.to_string(), Some(value)),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to serialize response: {}", e)),
    }
}

fn failure(code: StatusCode, message: String) -> Reply {
    respond(code, "error", message, None)
}

fn respond(code: StatusCode, status: &str, message: String, data: Option<serde_json::Value>) -> Reply {
    let response = ApiResponse {
        status: status.to_string(),
        message,
        data,
    };
    warp::reply::with_status(warp::reply::json(&response), code)
}

fn storage_failure(e: StorageError) -> Reply {
    match e {
        StorageError::InvalidTimeRange(message) => failure(StatusCode::BAD_REQUEST, message),
        other => {
            error!(error = %other, "Storage failure");
            failure(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn clinical_failure(e: ClinicalError) -> Reply {
    match e {
        ClinicalError::Storage(e) => storage_failure(e),
        other => failure(StatusCode::BAD_REQUEST, other.to_string()),
    }
}

pub struct RestApi {
    storage: Arc<StorageEngine>,
    ingestor: Arc<Ingestor>,
    classifier: Arc<Classifier>,
    alerts: Arc<AlertGenerator>,
}

impl RestApi {
    pub fn new(
        storage: Arc<StorageEngine>,
        ingestor: Arc<Ingestor>,
        classifier: Arc<Classifier>,
        alerts: Arc<AlertGenerator>,
    ) -> Self {
        RestApi { storage, ingestor, classifier, alerts }
    }

    pub fn from_config(storage: Arc<StorageEngine>, config: &Config) -> Self {
        let ingestor = Arc::new(Ingestor::new(Arc::clone(&storage), &config.ingest));
        let classifier = Arc::new(Classifier::new(Arc::clone(&storage), &config.clinical));
        let alerts = Arc::new(AlertGenerator::new(&config.alerts));
        RestApi::new(storage, ingestor, classifier, alerts)
    }

    pub fn routes(&self) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        self.upload()
            .or(self.register_patient())
            .or(self.list_patients())
            .or(self.recent_measurements())
            .or(self.attribute_measurements())
            .or(self.patient_alerts())
            .or(self.post_threshold())
            .or(self.get_threshold())
            .or(self.devices())
    }

    fn upload(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let ingestor = Arc::clone(&self.ingestor);

        warp::path!("upload" / String / String)
            .and(warp::post())
            .and(warp::header::optional::<String>("data-format"))
            .and(warp::body::json())
            .and_then(move |hardware: String, patient: String, format: Option<String>, envelope: DevicesPayload| {
                let ingestor = Arc::clone(&ingestor);
                async move {
                    let format = match format.as_deref().map(str::parse::<DataFormat>) {
                        Some(Ok(format)) => format,
                        Some(Err(message)) => {
                            return Ok::<Reply, Infallible>(failure(StatusCode::BAD_REQUEST, message));
                        }
                        None => {
                            return Ok(failure(StatusCode::BAD_REQUEST, "Data-Format header is required".to_string()));
                        }
                    };

                    let patient = PatientUuid::new(patient);
                    info!(hardware = %hardware, patient = %patient, upload = %envelope.upload_uuid, "Upload received");
                    match ingestor.process(&envelope, &patient, format).await {
                        Ok(report) => Ok(success("Upload processed", &report)),
                        Err(e) => {
                            let code = if e.is_client_error() {
                                StatusCode::BAD_REQUEST
                            } else {
                                StatusCode::INTERNAL_SERVER_ERROR
                            };
                            Ok(failure(code, upload_message(&e)))
                        }
                    }
                }
            })
    }

    fn register_patient(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let storage = Arc::clone(&self.storage);

        warp::path!("patients" / String)
            .and(warp::put())
            .and(warp::body::json())
            .and_then(move |patient: String, registration: PatientRegistration| {
                let storage = Arc::clone(&storage);
                async move {
                    let patient = Patient {
                        patient_uuid: PatientUuid::new(patient),
                        patient_group: registration.patient_group,
                    };
                    let registered = storage.begin().and_then(|mut tx| {
                        tx.register_patient(patient.clone());
                        tx.commit()
                    });
                    match registered {
                        Ok(_) => Ok::<Reply, Infallible>(success("Patient registered", &patient)),
                        Err(e) => Ok(storage_failure(e)),
                    }
                }
            })
    }

    fn list_patients(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let classifier = Arc::clone(&self.classifier);

        warp::path!("patients")
            .and(warp::get())
            .and(warp::query::<GroupQuery>())
            .and_then(move |query: GroupQuery| {
                let classifier = Arc::clone(&classifier);
                async move {
                    match patient_overviews(&classifier, query.group.as_deref(), Utc::now()) {
                        Ok(patients) => Ok::<Reply, Infallible>(success("Patients found", &patients)),
                        Err(e) => Ok(clinical_failure(e)),
                    }
                }
            })
    }

    fn recent_measurements(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let classifier = Arc::clone(&self.classifier);

        warp::path!("patients" / String / "recent")
            .and(warp::get())
            .and_then(move |patient: String| {
                let classifier = Arc::clone(&classifier);
                async move {
                    match recent(&classifier, &PatientUuid::new(patient), Utc::now()) {
                        Ok(readings) => Ok::<Reply, Infallible>(success("Recent measurements", &readings)),
                        Err(e) => Ok(clinical_failure(e)),
                    }
                }
            })
    }

    fn attribute_measurements(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let classifier = Arc::clone(&self.classifier);

        warp::path!("patients" / String / "attributes" / u64 / "measurements")
            .and(warp::get())
            .and(warp::query::<PeriodQuery>())
            .and_then(move |patient: String, attribute: u64, period: PeriodQuery| {
                let classifier = Arc::clone(&classifier);
                async move {
                    let patient = PatientUuid::new(patient);
                    let classified = classifier.storage()
                        .measurements(&patient, AttributeId(attribute), period.from, period.to)
                        .map_err(ClinicalError::from)
                        .and_then(|series| classifier.classify_series(series, Utc::now()));
                    match classified {
                        Ok(measurements) => Ok::<Reply, Infallible>(success("Measurements found", &measurements)),
                        Err(e) => Ok(clinical_failure(e)),
                    }
                }
            })
    }

    fn patient_alerts(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let classifier = Arc::clone(&self.classifier);
        let alerts = Arc::clone(&self.alerts);

        warp::path!("patients" / String / "alerts")
            .and(warp::get())
            .and_then(move |patient: String| {
                let classifier = Arc::clone(&classifier);
                let alerts = Arc::clone(&alerts);
                async move {
                    match alerts.patient_alerts(&classifier, &PatientUuid::new(patient), Utc::now()) {
                        Ok(found) => Ok::<Reply, Infallible>(success("Alerts", &found)),
                        Err(e) => Ok(clinical_failure(e)),
                    }
                }
            })
    }

    fn post_threshold(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let storage = Arc::clone(&self.storage);

        warp::path!("thresholds")
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |request: ThresholdRequest| {
                let storage = Arc::clone(&storage);
                async move {
                    match create_threshold(&storage, request) {
                        Ok(threshold) => Ok::<Reply, Infallible>(success("Threshold created", &threshold)),
                        Err(e) => Ok(clinical_failure(e)),
                    }
                }
            })
    }

    fn get_threshold(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let classifier = Arc::clone(&self.classifier);

        warp::path!("thresholds" / String / u64)
            .and(warp::get())
            .and(warp::query::<AtQuery>())
            .and_then(move |patient: String, attribute: u64, query: AtQuery| {
                let classifier = Arc::clone(&classifier);
                async move {
                    let at = query.at.unwrap_or_else(Utc::now);
                    match classifier.resolve_threshold(AttributeId(attribute), &PatientUuid::new(patient), at) {
                        Ok(Some(threshold)) => Ok::<Reply, Infallible>(success("Threshold found", &threshold)),
                        Ok(None) => Ok(failure(StatusCode::NOT_FOUND, "No threshold configured".to_string())),
                        Err(e) => Ok(clinical_failure(e)),
                    }
                }
            })
    }

    fn devices(&self) -> impl Filter<Extract = (Reply,), Error = warp::Rejection> + Clone {
        let storage = Arc::clone(&self.storage);

        warp::path!("devices")
            .and(warp::get())
            .and_then(move || {
                let storage = Arc::clone(&storage);
                async move {
                    let registry = storage.device_types().and_then(|device_types| {
                        Ok(serde_json::json!({
                            "device_types": device_types,
                            "attributes": storage.attributes()?,
                        }))
                    });
                    match registry {
                        Ok(registry) => Ok::<Reply, Infallible>(success("Registered devices", &registry)),
                        Err(e) => Ok(storage_failure(e)),
                    }
                }
            })
    }
}

fn upload_message(e: &IngestError) -> String {
    match e {
        IngestError::Storage(_) => format!("Attempt to write data failed: {}", e),
        _ => e.to_string(),
    }
}

fn recent(classifier: &Classifier, patient: &PatientUuid, now: DateTime<Utc>) -> Result<Vec<RecentMeasurement>, ClinicalError> {
    let storage = classifier.storage();
    let mut readings = Vec::new();
    for measurement in storage.latest_measurements(patient)? {
        let attribute = match storage.attribute(measurement.attribute_id)? {
            Some(attribute) => attribute,
            None => continue,
        };
        readings.push(RecentMeasurement {
            attribute_name: attribute.attribute_name,
            attribute_units: attribute.attribute_units,
            reading: classifier.classify_latest(measurement, now)?,
        });
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::payload::DeviceData;
    use pretty_assertions::assert_eq;

    const OXIMETER: &str = "metadata->datadelimiter->^\n\
                            metadata->make->Contec\n\
                            metadata->model->CMS50D+\n\
                            metadata->displayname->Finger Oximeter\n\
                            metadata->columns->iso8601time^pulse^spo2\n\
                            metadata->format->DATE^INTEGER^INTEGER\n\
                            metadata->units->NONE^BPM^%\n";

    fn api() -> (Arc<StorageEngine>, RestApi) {
        let storage = Arc::new(StorageEngine::in_memory());
        let api = RestApi::from_config(Arc::clone(&storage), &Config::default());
        (storage, api)
    }

    fn envelope(payload: String) -> DevicesPayload {
        DevicesPayload {
            upload_uuid: "u-1".to_string(),
            uploaded_date: None,
            payload: vec![DeviceData {
                device_data_uuid: "dd-1".to_string(),
                profile_id: "urn:nhs-en:profile:Oximeter".to_string(),
                payload,
            }],
        }
    }

    fn body(res: &warp::http::Response<impl AsRef<[u8]>>) -> ApiResponse {
        serde_json::from_slice(res.body().as_ref()).unwrap()
    }

    #[tokio::test]
    async fn test_upload_and_recent() {
        let (storage, api) = api();
        let routes = api.routes();

        let res = warp::test::request()
            .method("POST")
            .path("/upload/hw-1/p-1")
            .header("Data-Format", "native")
            .json(&envelope(format!("{}2024-01-01T00:00:00Z^72^98\n", OXIMETER)))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let response = body(&res);
        assert_eq!(response.data.unwrap()["rows_written"], 2);
        assert_eq!(storage.measurement_count().unwrap(), 2);

        let res = warp::test::request().path("/patients/p-1/recent").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::OK);
        let recent = body(&res).data.unwrap();
        assert_eq!(recent.as_array().unwrap().len(), 2);
        assert_eq!(recent[0]["attribute_name"], "pulse");
        assert_eq!(recent[0]["alert_status"], "CANNOT_CALCULATE");
    }

    #[tokio::test]
    async fn test_upload_rejections() {
        let (storage, api) = api();
        let routes = api.routes();

        let bad = OXIMETER.replace("DATE^INTEGER^INTEGER", "DATE^INTEGER") + "2024-01-01T00:00:00Z^72^98\n";
        let res = warp::test::request()
            .method("POST")
            .path("/upload/hw-1/p-1")
            .header("Data-Format", "native")
            .json(&envelope(bad))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&res).status, "error");

        let res = warp::test::request()
            .method("POST")
            .path("/upload/hw-1/p-1")
            .header("Data-Format", "hl7")
            .json(&envelope(OXIMETER.to_string()))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .method("POST")
            .path("/upload/hw-1/p-1")
            .json(&envelope(OXIMETER.to_string()))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(storage.measurement_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_threshold_lifecycle() {
        let (_, api) = api();
        let routes = api.routes();

        warp::test::request()
            .method("POST")
            .path("/upload/hw-1/p-1")
            .header("Data-Format", "native")
            .json(&envelope(format!("{}2024-07-01T00:00:00Z^110^98\n", OXIMETER)))
            .reply(&routes)
            .await;

        for (effective, low, high) in [("2024-01-01T00:00:00Z", "60", "100"), ("2024-06-01T00:00:00Z", "65", "105")] {
            let res = warp::test::request()
                .method("POST")
                .path("/thresholds")
                .json(&serde_json::json!({
                    "attribute_id": 1,
                    "patient_uuid": "p-1",
                    "threshold_type": "simple-inclusive-high-low",
                    "threshold_low_value": low,
                    "threshold_high_value": high,
                    "effective_date": effective,
                }))
                .reply(&routes)
                .await;
            assert_eq!(res.status(), StatusCode::OK);
        }

        let res = warp::test::request()
            .path("/thresholds/p-1/1?at=2024-03-01T00:00:00Z")
            .reply(&routes)
            .await;
        assert_eq!(body(&res).data.unwrap()["threshold_low_value"], "60");

        let res = warp::test::request()
            .path("/patients/p-1/attributes/1/measurements")
            .reply(&routes)
            .await;
        let measurements = body(&res).data.unwrap();
        assert_eq!(measurements[0]["alert_status"], "OUT_OF_THRESHOLD");
        assert_eq!(measurements[0]["max_value"], "105");

        let res = warp::test::request()
            .method("POST")
            .path("/thresholds")
            .json(&serde_json::json!({
                "attribute_id": 1,
                "patient_uuid": "p-1",
                "threshold_type": "no-such-test",
                "threshold_low_value": "1",
                "threshold_high_value": "2",
                "effective_date": "2024-01-01T00:00:00Z",
            }))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_patients_and_devices() {
        let (_, api) = api();
        let routes = api.routes();

        let res = warp::test::request()
            .method("PUT")
            .path("/patients/p-9")
            .json(&PatientRegistration { patient_group: Some("north".to_string()) })
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request().path("/patients?group=north").reply(&routes).await;
        let patients = body(&res).data.unwrap();
        assert_eq!(patients[0]["patient_uuid"], "p-9");
        assert_eq!(patients[0]["patient_status"], "INCOMPLETE_SCHEDULE");

        let res = warp::test::request().path("/devices").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(body(&res).data.unwrap()["device_types"].as_array().unwrap().is_empty());

        let res = warp::test::request()
            .path("/patients/p-9/attributes/1/measurements?from=2024-02-01T00:00:00Z&to=2024-01-01T00:00:00Z")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request().path("/patients/p-9/alerts").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::OK);
    }
}
